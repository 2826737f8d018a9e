//! GitHub contents API implementation of the content store

use super::{DatedFile, StoreError};
use crate::runtime::ContentStore;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const GITHUB_API: &str = "https://api.github.com";

/// Repository coordinates and layout
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Directory holding one markdown file per day
    pub content_path: String,
    /// Directory holding uploaded images
    pub image_path: String,
}

/// Content store backed by one branch of one GitHub repository
pub struct GitHubStore {
    client: Client,
    config: GitHubConfig,
}

impl GitHubStore {
    pub fn new(config: GitHubConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("daybook"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|e| StoreError::Malformed(format!("invalid GitHub token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{GITHUB_API}/repos/{}/{}/contents/{path}",
            self.config.owner, self.config.repo
        )
    }

    fn day_path(&self, date_key: &str) -> String {
        format!("{}/{date_key}.md", self.config.content_path.trim_end_matches('/'))
    }

    fn image_file_path(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.config.image_path.trim_end_matches('/'))
    }

    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        message: &str,
        sha: Option<&str>,
    ) -> Result<String, StoreError> {
        let body = put_body(message, bytes, &self.config.branch, sha);
        let response = self
            .client
            .put(self.contents_url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_put_failure(status, text, path, sha.is_some()));
        }

        let parsed: PutResponse = serde_json::from_str(&text)
            .map_err(|e| StoreError::Malformed(format!("{e} - body: {text}")))?;
        Ok(parsed.content.sha)
    }
}

#[async_trait]
impl ContentStore for GitHubStore {
    async fn read(&self, date_key: &str) -> Result<Option<DatedFile>, StoreError> {
        let path = self.day_path(date_key);
        let response = self
            .client
            .get(self.contents_url(&path))
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Network(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(StoreError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ContentsResponse = serde_json::from_str(&text)
            .map_err(|e| StoreError::Malformed(format!("{path}: {e}")))?;
        let content = decode_content(parsed.content.as_deref().unwrap_or_default())?;

        Ok(Some(DatedFile {
            date_key: date_key.to_string(),
            content,
            revision_token: parsed.sha,
        }))
    }

    async fn write(
        &self,
        date_key: &str,
        full_text: &str,
        message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, StoreError> {
        let path = self.day_path(date_key);
        let sha = self
            .put(&path, full_text.as_bytes(), message, expected_revision)
            .await?;
        tracing::info!(%path, revision = %sha, "Wrote dated file");
        Ok(sha)
    }

    async fn write_image(&self, file_name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.image_file_path(file_name);
        self.put(&path, bytes, &format!("Add image {file_name}"), None)
            .await?;
        tracing::info!(%path, size = bytes.len(), "Uploaded image");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContent,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

fn put_body(message: &str, bytes: &[u8], branch: &str, sha: Option<&str>) -> Value {
    let mut body = json!({
        "message": message,
        "content": STANDARD.encode(bytes),
        "branch": branch,
    });
    if let Some(sha) = sha {
        body["sha"] = Value::String(sha.to_string());
    }
    body
}

/// The API wraps base64 content at 60 columns
fn decode_content(encoded: &str) -> Result<String, StoreError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| StoreError::Malformed(format!("invalid base64 content: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Malformed(format!("non-UTF-8 content: {e}")))
}

fn classify_put_failure(status: StatusCode, body: String, path: &str, had_sha: bool) -> StoreError {
    match status.as_u16() {
        409 => StoreError::Conflict {
            path: path.to_string(),
        },
        // 422 means a sha was required but missing, or did not match
        422 if had_sha => StoreError::Conflict {
            path: path.to_string(),
        },
        422 => StoreError::AlreadyExists {
            path: path.to_string(),
        },
        code => StoreError::Http { status: code, body },
    }
}
