//! Chat platform transport

mod slack;

pub use slack::SlackTransport;
use thiserror::Error;

/// Credentials for Slack Socket Mode
#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// `xoxb-` token for Web API calls and file downloads
    pub bot_token: String,
    /// `xapp-` token for opening socket connections
    pub app_token: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("slack API error: {0}")]
    Api(String),
    #[error("socket error: {0}")]
    Socket(String),
}
