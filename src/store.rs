//! Dated-file content store
//!
//! One markdown file per calendar day, written through the
//! [`ContentStore`] seam with revision tokens for optimistic concurrency.
//! The helpers here implement the journal layout on top of the raw
//! get/put primitives: the dated header on a day's first entry, the
//! separator between entries, and the recent-days window used by edits.

mod github;

pub use github::{GitHubConfig, GitHubStore};

use crate::runtime::ContentStore;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use futures::future::try_join_all;
use thiserror::Error;

/// Marker inserted between two entries of the same day
pub const ENTRY_SEPARATOR: &str = "\n\n---\n\n";

/// A day's file as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedFile {
    pub date_key: String,
    pub content: String,
    pub revision_token: String,
}

/// Result of appending an entry to a day's file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub date_key: String,
    pub revision_token: String,
    /// Whether this entry created the day's file
    pub created: bool,
}

/// Errors from the content store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The revision token no longer matches the stored file
    #[error("{path} was modified since it was read")]
    Conflict { path: String },
    /// A create found the file already present
    #[error("{path} already exists")]
    AlreadyExists { path: String },
    #[error("content store request failed: {0}")]
    Network(String),
    #[error("content store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed content store response: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Stale-token failures, reported to the principal distinctly
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }
}

/// Calendar date of `now` in the principal's timezone
pub fn local_date(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// `YYYY-MM-DD` key of the day containing `now`
pub fn date_key(now: DateTime<Utc>, offset: FixedOffset) -> String {
    format_date_key(local_date(now, offset))
}

pub fn format_date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Header written at the top of a day's first entry
pub fn day_header(date_key: &str) -> String {
    format!("---\ndate: {date_key}\n---\n\n")
}

/// Join entry text and image embeds with blank lines. The text is kept
/// exactly as reviewed.
pub fn compose_entry(text: Option<&str>, embeds: &[String]) -> String {
    text.filter(|t| !t.trim().is_empty())
        .into_iter()
        .chain(embeds.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Append an entry to the day's file, creating it with a header if absent.
///
/// Appends are compare-and-swap against the token just read; creates fail
/// if another writer created the file first.
pub async fn append_entry<S: ContentStore + ?Sized>(
    store: &S,
    date_key: &str,
    entry: &str,
) -> Result<CommitReceipt, StoreError> {
    let message = format!("Add entry for {date_key}");
    match store.read(date_key).await? {
        Some(existing) => {
            let content = format!(
                "{}{ENTRY_SEPARATOR}{entry}\n",
                existing.content.trim_end()
            );
            let revision_token = store
                .write(date_key, &content, &message, Some(&existing.revision_token))
                .await?;
            Ok(CommitReceipt {
                date_key: date_key.to_string(),
                revision_token,
                created: false,
            })
        }
        None => {
            let content = format!("{}{entry}\n", day_header(date_key));
            let revision_token = store.write(date_key, &content, &message, None).await?;
            Ok(CommitReceipt {
                date_key: date_key.to_string(),
                revision_token,
                created: true,
            })
        }
    }
}

/// Read the last `days` dated files ending at `today`, most recent first.
/// The reads run concurrently; the first failure fails the whole window.
pub async fn recent_files<S: ContentStore + ?Sized>(
    store: &S,
    today: NaiveDate,
    days: u32,
) -> Result<Vec<DatedFile>, StoreError> {
    let keys: Vec<String> = (0..u64::from(days))
        .map_while(|back| today.checked_sub_days(Days::new(back)))
        .map(format_date_key)
        .collect();
    let reads = keys.iter().map(|key| store.read(key));
    let files = try_join_all(reads).await?;
    Ok(files.into_iter().flatten().collect())
}
