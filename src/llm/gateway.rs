//! Typed gateway over the completion API
//!
//! Each call shape has a fixed system prompt and a validated reply. The
//! model is asked for bare JSON, but replies are treated as untrusted:
//! code fences are stripped and every field is checked before a typed
//! value is handed to the orchestrator.

use super::{LlmError, LlmRequest, LlmService};
use crate::runtime::Gateway;
use crate::store::DatedFile;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;

const CLASSIFY_PROMPT: &str = r#"You sort messages sent to a personal publishing assistant.
Decide whether the message is:
- "content": a thought, note or observation the author wants published as-is
- "instruction": a request to change something already published (fix a typo, remove a line, add a photo to an earlier post)
- "ambiguous": you cannot tell which of the two the author means

Reply with JSON only: {"label": "content" | "instruction" | "ambiguous"}"#;

const REVIEW_PROMPT: &str = r#"You proofread short posts before they are published to a personal site.
Keep the author's voice, wording and formatting. Fix only obvious spelling, punctuation and grammar mistakes.
- If you changed nothing, or only fixed trivial typos, reply with decision "publish" and the final text.
- If a better version needs changes beyond trivial fixes, reply with decision "suggest", your improved text, and a one-sentence explanation.

Reply with JSON only: {"decision": "publish" | "suggest", "text": "...", "explanation": "..."}"#;

const CRAFT_PROMPT: &str = "You help the author write a short post for their personal site. \
Write in first person, plainly and warmly, in at most three short paragraphs. \
Reply with the post text only: no title, no preamble, no quotes.";

const EDIT_PROMPT: &str = r#"You edit a personal site made of one markdown file per day. You are given today's date, the author's instruction, and the recent files, each with its date key.
Decide one of:
- "edit": apply the instruction to exactly one file and return that file's complete new content in "fullText", its "dateKey", and a short "explanation". Preserve everything you were not asked to change, including the front matter and the "---" separators between entries. If the file is more than 2 days older than today, also set "warning" to a sentence telling the author they are editing an older post.
- "unclear": you need more information; put one short question in "clarification".
- "unsupported": the request cannot be done by editing these files; put the reason in "reason".
If an image reference is provided, embed it where the instruction asks.

Reply with JSON only: {"decision": "edit" | "unclear" | "unsupported", "dateKey": "...", "fullText": "...", "explanation": "...", "clarification": "...", "reason": "...", "warning": "..."}"#;

/// Gateway failures
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("malformed gateway reply: {0}")]
    Malformed(String),
}

/// Classification of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Content,
    Instruction,
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Only trivial fixes; publish immediately
    Publish,
    /// Non-trivial change proposed; ask the principal
    Suggest,
}

/// Reviewed text with the action to take
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub decision: ReviewDecision,
    pub text: String,
    pub explanation: String,
}

/// Outcome of an edit instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditDecision {
    Edit {
        date_key: String,
        full_text: String,
        explanation: String,
        warning: Option<String>,
    },
    Unclear {
        question: String,
    },
    Unsupported {
        reason: String,
    },
}

/// [`Gateway`] backed by an [`LlmService`]
pub struct LlmGateway {
    llm: Arc<dyn LlmService>,
}

impl LlmGateway {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self { llm }
    }

    async fn ask(&self, system: &str, user: String, max_tokens: u32) -> Result<String, GatewayError> {
        let request = LlmRequest::single_turn(system, user, max_tokens);
        let response = self.llm.complete(&request).await?;
        if !response.end_turn {
            tracing::warn!(model = %self.llm.model_id(), "LLM reply did not end its turn; it may be truncated");
        }
        Ok(response.text())
    }
}

#[async_trait]
impl Gateway for LlmGateway {
    async fn classify(&self, text: &str, prior_turn: Option<&str>) -> Result<Intent, GatewayError> {
        let reply = self
            .ask(CLASSIFY_PROMPT, classify_input(text, prior_turn), 64)
            .await?;
        parse_intent(&reply)
    }

    async fn review(&self, text: &str) -> Result<Review, GatewayError> {
        let reply = self.ask(REVIEW_PROMPT, text.to_string(), 2048).await?;
        parse_review(&reply, text)
    }

    async fn craft(&self, topic: &str) -> Result<String, GatewayError> {
        let reply = self
            .ask(CRAFT_PROMPT, format!("Topic: {topic}"), 1024)
            .await?;
        let text = reply.trim();
        if text.is_empty() {
            return Err(GatewayError::Malformed("empty crafted text".to_string()));
        }
        Ok(text.to_string())
    }

    async fn execute_edit(
        &self,
        instruction: &str,
        recent: &[DatedFile],
        image_ref: Option<&str>,
        today: &str,
    ) -> Result<EditDecision, GatewayError> {
        let reply = self
            .ask(EDIT_PROMPT, edit_input(instruction, recent, image_ref, today), 8192)
            .await?;
        parse_edit_decision(&reply)
    }
}

fn classify_input(text: &str, prior_turn: Option<&str>) -> String {
    match prior_turn {
        Some(prior) => format!("Previous turn: {prior}\n\nMessage:\n{text}"),
        None => format!("Message:\n{text}"),
    }
}

fn edit_input(instruction: &str, recent: &[DatedFile], image_ref: Option<&str>, today: &str) -> String {
    let mut input = format!("Today is {today}.\n\nInstruction:\n{instruction}\n");
    if let Some(image) = image_ref {
        let _ = write!(input, "\nNew image reference:\n{image}\n");
    }
    for file in recent {
        let _ = write!(
            input,
            "\n=== dateKey: {} ===\n{}\n",
            file.date_key, file.content
        );
    }
    input
}

/// Remove a surrounding markdown code fence, if any
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, GatewayError> {
    let body = strip_code_fences(raw);
    serde_json::from_str(body).map_err(|e| GatewayError::Malformed(format!("{e}: {body}")))
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    label: String,
}

fn parse_intent(raw: &str) -> Result<Intent, GatewayError> {
    let parsed: RawClassification = parse_json(raw)?;
    match parsed.label.trim().to_ascii_lowercase().as_str() {
        "content" => Ok(Intent::Content),
        "instruction" => Ok(Intent::Instruction),
        "ambiguous" => Ok(Intent::Ambiguous),
        other => Err(GatewayError::Malformed(format!("unknown label {other:?}"))),
    }
}

#[derive(Debug, Deserialize)]
struct RawReview {
    decision: String,
    text: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
}

/// A publish decision without text means "publish the original"
fn parse_review(raw: &str, original: &str) -> Result<Review, GatewayError> {
    let parsed: RawReview = parse_json(raw)?;
    let text = parsed.text.filter(|t| !t.trim().is_empty());
    let explanation = parsed.explanation.unwrap_or_default();
    match parsed.decision.trim().to_ascii_lowercase().as_str() {
        "publish" => Ok(Review {
            decision: ReviewDecision::Publish,
            text: text.unwrap_or_else(|| original.to_string()),
            explanation,
        }),
        "suggest" => {
            let text = text
                .ok_or_else(|| GatewayError::Malformed("suggest without text".to_string()))?;
            Ok(Review {
                decision: ReviewDecision::Suggest,
                text,
                explanation,
            })
        }
        other => Err(GatewayError::Malformed(format!("unknown decision {other:?}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEditDecision {
    decision: String,
    #[serde(default, alias = "date_key")]
    date_key: Option<String>,
    #[serde(default, alias = "full_text")]
    full_text: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    clarification: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    warning: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_edit_decision(raw: &str) -> Result<EditDecision, GatewayError> {
    let parsed: RawEditDecision = parse_json(raw)?;
    match parsed.decision.trim().to_ascii_lowercase().as_str() {
        "edit" => {
            let date_key = non_empty(parsed.date_key)
                .ok_or_else(|| GatewayError::Malformed("edit without dateKey".to_string()))?;
            if NaiveDate::parse_from_str(&date_key, "%Y-%m-%d").is_err() {
                return Err(GatewayError::Malformed(format!(
                    "dateKey {date_key:?} is not YYYY-MM-DD"
                )));
            }
            let full_text = non_empty(parsed.full_text)
                .ok_or_else(|| GatewayError::Malformed("edit without fullText".to_string()))?;
            Ok(EditDecision::Edit {
                date_key,
                full_text,
                explanation: parsed.explanation.unwrap_or_default(),
                warning: non_empty(parsed.warning),
            })
        }
        "unclear" => Ok(EditDecision::Unclear {
            question: non_empty(parsed.clarification)
                .unwrap_or_else(|| "Could you say a bit more about what to change?".to_string()),
        }),
        "unsupported" => Ok(EditDecision::Unsupported {
            reason: non_empty(parsed.reason)
                .unwrap_or_else(|| "That isn't something I can do.".to_string()),
        }),
        other => Err(GatewayError::Malformed(format!("unknown decision {other:?}"))),
    }
}
