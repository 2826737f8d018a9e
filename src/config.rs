//! Process configuration from environment variables

use crate::store::GitHubConfig;
use crate::transport::SlackConfig;
use chrono::FixedOffset;
use thiserror::Error;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_RECENT_DAYS: u32 = 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Everything the process needs to start
#[derive(Debug, Clone)]
pub struct Config {
    /// Chat user id of the single authorized principal
    pub principal_id: String,
    pub slack: SlackConfig,
    pub github: GitHubConfig,
    /// Public URL prefix under which uploaded images are served
    pub image_url_prefix: String,
    /// Offset of the principal's local time, used for date keys
    pub utc_offset: FixedOffset,
    /// Days of history offered to the edit call
    pub recent_days: u32,
    pub anthropic_api_key: String,
    pub llm_gateway: Option<String>,
    pub model: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let repo = required("GITHUB_REPO")?;
        let (owner, name) = repo
            .split_once('/')
            .filter(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| ConfigError::Invalid {
                var: "GITHUB_REPO",
                reason: format!("expected owner/name, got {repo:?}"),
            })?;

        let utc_offset = match get("DAYBOOK_UTC_OFFSET") {
            Some(raw) => parse_offset(&raw).ok_or_else(|| ConfigError::Invalid {
                var: "DAYBOOK_UTC_OFFSET",
                reason: format!("expected +HH:MM, got {raw:?}"),
            })?,
            None => FixedOffset::east_opt(0).ok_or_else(|| ConfigError::Invalid {
                var: "DAYBOOK_UTC_OFFSET",
                reason: "zero offset out of range".to_string(),
            })?,
        };

        let recent_days = match get("DAYBOOK_RECENT_DAYS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|days| *days > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    var: "DAYBOOK_RECENT_DAYS",
                    reason: format!("expected a positive integer, got {raw:?}"),
                })?,
            None => DEFAULT_RECENT_DAYS,
        };

        Ok(Self {
            principal_id: required("DAYBOOK_PRINCIPAL_ID")?,
            slack: SlackConfig {
                bot_token: required("SLACK_BOT_TOKEN")?,
                app_token: required("SLACK_APP_TOKEN")?,
            },
            github: GitHubConfig {
                token: required("GITHUB_TOKEN")?,
                owner: owner.to_string(),
                repo: name.to_string(),
                branch: get("GITHUB_BRANCH").unwrap_or_else(|| "main".to_string()),
                content_path: get("DAYBOOK_CONTENT_PATH")
                    .unwrap_or_else(|| "content/daybook".to_string()),
                image_path: get("DAYBOOK_IMAGE_PATH")
                    .unwrap_or_else(|| "static/images/daybook".to_string()),
            },
            image_url_prefix: get("DAYBOOK_IMAGE_URL_PREFIX")
                .unwrap_or_else(|| "/images/daybook".to_string()),
            utc_offset,
            recent_days,
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            llm_gateway: get("LLM_GATEWAY"),
            model: get("DAYBOOK_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    match raw {
        "Z" | "UTC" | "utc" => FixedOffset::east_opt(0),
        _ => raw.parse().ok(),
    }
}
