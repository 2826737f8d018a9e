//! Slack Socket Mode transport
//!
//! Inbound events arrive over a WebSocket opened with the app token, so the
//! process needs no public endpoint. Outbound messages go through the Web API.

use super::{SlackConfig, TransportError};
use crate::runtime::Transport;
use crate::state_machine::{AttachmentRef, ButtonAction, Choice, Event, InboundMessage, Outbound};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const API_BASE: &str = "https://slack.com/api";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Slack rejects button values longer than this
const MAX_BUTTON_VALUE: usize = 2000;
/// Section block text limit
const MAX_SECTION_TEXT: usize = 3000;

pub struct SlackTransport {
    config: SlackConfig,
    client: reqwest::Client,
}

/// Why a socket session ended
enum SocketExit {
    Reconnect,
    /// The runtime dropped its receiver
    Shutdown,
}

impl SlackTransport {
    pub fn new(config: SlackConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.bot_token))
            .map_err(|e| TransportError::Api(format!("invalid bot token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Call a Web API method and check Slack's `ok` flag
    async fn api_call(&self, method: &str, token: Option<&str>, body: &Value) -> Result<Value, TransportError> {
        let mut request = self.client.post(format!("{API_BASE}/{method}")).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        // Slack reports most failures as 200 with ok=false
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Api(format!("{method}: invalid JSON: {e}")))?;
        if parsed.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = parsed
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(TransportError::Api(format!("{method}: {error}")));
        }
        Ok(parsed)
    }

    async fn open_connection(&self) -> Result<String, TransportError> {
        let response = self
            .api_call(
                "apps.connections.open",
                Some(&self.config.app_token),
                &json!({}),
            )
            .await?;
        response
            .get("url")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| TransportError::Api("apps.connections.open: missing url".to_string()))
    }

    /// Forward inbound events until the runtime goes away, reconnecting as needed
    pub async fn listen(&self, tx: mpsc::Sender<Event>) {
        loop {
            match self.run_socket(&tx).await {
                Ok(SocketExit::Shutdown) => {
                    tracing::info!("Event receiver closed; Slack listener stopping");
                    return;
                }
                Ok(SocketExit::Reconnect) => tracing::info!("Slack socket closed; reconnecting"),
                Err(e) => tracing::warn!(error = %e, "Slack socket failed; reconnecting"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_socket(&self, tx: &mpsc::Sender<Event>) -> Result<SocketExit, TransportError> {
        let url = self.open_connection().await?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Socket(format!("connect: {e}")))?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!("Connected to Slack Socket Mode");

        while let Some(message) = read.next().await {
            let message = message.map_err(|e| TransportError::Socket(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => return Ok(SocketExit::Reconnect),
                _ => continue,
            };

            let envelope: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring undecodable socket frame");
                    continue;
                }
            };

            if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                let ack = json!({ "envelope_id": envelope_id });
                write
                    .send(Message::Text(ack.to_string().into()))
                    .await
                    .map_err(|e| TransportError::Socket(format!("ack: {e}")))?;
            }

            match envelope.get("type").and_then(Value::as_str) {
                Some("hello") => tracing::debug!("Slack socket hello"),
                Some("disconnect") => {
                    let reason = envelope.get("reason").and_then(Value::as_str);
                    tracing::info!(?reason, "Slack requested disconnect");
                    return Ok(SocketExit::Reconnect);
                }
                _ => {
                    if let Some(event) = parse_envelope(&envelope) {
                        if tx.send(event).await.is_err() {
                            return Ok(SocketExit::Shutdown);
                        }
                    }
                }
            }
        }
        Ok(SocketExit::Reconnect)
    }
}

#[async_trait]
impl Transport for SlackTransport {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError> {
        for body in post_bodies(message) {
            self.api_call("chat.postMessage", None, &body).await?;
        }
        Ok(())
    }

    async fn download(&self, attachment: &AttachmentRef) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(format!("failed to read file: {e}")))?;
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// Envelope parsing
// ============================================================================

/// Turn a Socket Mode envelope into a runtime event, if it carries one
pub fn parse_envelope(envelope: &Value) -> Option<Event> {
    let payload = envelope.get("payload")?;
    match envelope.get("type").and_then(Value::as_str)? {
        "events_api" => parse_message_event(payload.get("event")?),
        "interactive" => parse_block_action(payload),
        _ => None,
    }
}

fn parse_message_event(event: &Value) -> Option<Event> {
    if event.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    // Our own posts, edits and deletions all arrive as message events
    if event.get("bot_id").is_some() {
        return None;
    }
    match event.get("subtype").and_then(Value::as_str) {
        None | Some("file_share") => {}
        Some(_) => return None,
    }

    let sender = event.get("user").and_then(Value::as_str)?;
    let channel = event.get("channel").and_then(Value::as_str)?;
    let text = event
        .get("text")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Some(Event::Message {
        sender: sender.to_string(),
        channel: channel.to_string(),
        message: InboundMessage {
            text,
            attachments: parse_files(event),
        },
    })
}

fn parse_files(event: &Value) -> Vec<AttachmentRef> {
    event
        .get("files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|file| {
                    let url = file
                        .get("url_private_download")
                        .or_else(|| file.get("url_private"))
                        .and_then(Value::as_str)?;
                    let str_field = |key: &str| {
                        file.get(key)
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                    };
                    Some(AttachmentRef {
                        id: str_field("id").unwrap_or_default(),
                        name: str_field("name"),
                        mime_type: str_field("mimetype"),
                        url: url.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_block_action(payload: &Value) -> Option<Event> {
    if payload.get("type").and_then(Value::as_str) != Some("block_actions") {
        return None;
    }
    let sender = payload.pointer("/user/id").and_then(Value::as_str)?;
    let channel = payload
        .pointer("/channel/id")
        .or_else(|| payload.pointer("/container/channel_id"))
        .and_then(Value::as_str)?;
    let action = payload.pointer("/actions/0")?;
    let action_id = action.get("action_id").and_then(Value::as_str)?;
    let Some(button) = ButtonAction::from_action_id(action_id) else {
        tracing::warn!(%action_id, "Unknown button action");
        return None;
    };

    Some(Event::Button {
        sender: sender.to_string(),
        channel: channel.to_string(),
        action: button,
        value: action
            .get("value")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

// ============================================================================
// Outbound rendering
// ============================================================================

fn button(choice: &Choice) -> Option<Value> {
    let mut button = json!({
        "type": "button",
        "text": { "type": "plain_text", "text": choice.label },
        "action_id": choice.action.action_id(),
    });
    if let Some(value) = &choice.value {
        if value.chars().count() > MAX_BUTTON_VALUE {
            tracing::warn!(
                action = choice.action.action_id(),
                len = value.chars().count(),
                "Dropping button whose value exceeds Slack's limit"
            );
            return None;
        }
        button["value"] = Value::String(value.clone());
    }
    Some(button)
}

/// `chat.postMessage` bodies for one outbound message.
///
/// Text that does not fit in a section block is posted on its own, followed
/// by a short message carrying the buttons.
pub fn post_bodies(message: &Outbound) -> Vec<Value> {
    let plain = |text: &str| json!({ "channel": message.channel, "text": text });

    let buttons: Vec<Value> = message.choices.iter().filter_map(button).collect();
    if buttons.is_empty() {
        return vec![plain(&message.text)];
    }

    let actions = json!({ "type": "actions", "elements": buttons });
    if message.text.chars().count() > MAX_SECTION_TEXT {
        let prompt = "Choose an option:";
        return vec![
            plain(&message.text),
            json!({
                "channel": message.channel,
                "text": prompt,
                "blocks": [
                    { "type": "section", "text": { "type": "mrkdwn", "text": prompt } },
                    actions,
                ],
            }),
        ];
    }

    vec![json!({
        "channel": message.channel,
        "text": message.text,
        "blocks": [
            { "type": "section", "text": { "type": "mrkdwn", "text": message.text } },
            actions,
        ],
    })]
}
