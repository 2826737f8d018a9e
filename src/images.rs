//! Image pipeline: filter attachments, transfer them into the content store,
//! and produce markdown embeds.

use crate::runtime::{ContentStore, Transport};
use crate::state_machine::AttachmentRef;
use chrono::{DateTime, FixedOffset, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};

/// Image formats accepted from the chat platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
}

impl ImageKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            "image/heic" | "image/heif" => Some(Self::Heic),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "heic" | "heif" => Some(Self::Heic),
            _ => None,
        }
    }

    /// Mime type first, file extension as a fallback
    pub fn detect(attachment: &AttachmentRef) -> Option<Self> {
        attachment
            .mime_type
            .as_deref()
            .and_then(Self::from_mime)
            .or_else(|| attachment.name.as_deref().and_then(Self::from_file_name))
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Heic => "heic",
        }
    }
}

/// Attachments the pipeline can handle, in their original order
pub fn supported_images(attachments: &[AttachmentRef]) -> Vec<(&AttachmentRef, ImageKind)> {
    attachments
        .iter()
        .filter_map(|a| match ImageKind::detect(a) {
            Some(kind) => Some((a, kind)),
            None => {
                tracing::debug!(id = %a.id, mime = ?a.mime_type, "Skipping non-image attachment");
                None
            }
        })
        .collect()
}

/// Result of one batch of transfers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadBatch {
    /// Embeds for the images that made it, in attachment order
    pub embeds: Vec<String>,
    /// Supported images that were attempted
    pub attempted: usize,
}

pub struct ImagePipeline {
    sequence: AtomicU64,
    url_prefix: String,
    utc_offset: FixedOffset,
}

impl ImagePipeline {
    pub fn new(url_prefix: impl Into<String>, utc_offset: FixedOffset) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
            utc_offset,
        }
    }

    /// `{date_key}-{HHMMSS}-{seq}.{ext}`, unique within the process
    pub fn file_name(&self, now: DateTime<Utc>, kind: ImageKind) -> String {
        let local = now.with_timezone(&self.utc_offset);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{seq}.{}",
            local.format("%Y-%m-%d"),
            local.format("%H%M%S"),
            kind.extension()
        )
    }

    pub fn embed(&self, file_name: &str) -> String {
        format!("![image]({}/{file_name})", self.url_prefix)
    }

    /// Download every supported attachment and write it to the store.
    ///
    /// Transfers run concurrently; a failed transfer is logged and left out.
    pub async fn transfer<T, S>(
        &self,
        transport: &T,
        store: &S,
        attachments: &[AttachmentRef],
        now: DateTime<Utc>,
    ) -> UploadBatch
    where
        T: Transport + ?Sized,
        S: ContentStore + ?Sized,
    {
        let images = supported_images(attachments);
        let attempted = images.len();

        let transfers = images.into_iter().map(|(attachment, kind)| {
            let file_name = self.file_name(now, kind);
            async move {
                let bytes = match transport.download(attachment).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(id = %attachment.id, error = %e, "Image download failed");
                        return None;
                    }
                };
                match store.write_image(&file_name, &bytes).await {
                    Ok(()) => Some(self.embed(&file_name)),
                    Err(e) => {
                        tracing::warn!(id = %attachment.id, %file_name, error = %e, "Image upload failed");
                        None
                    }
                }
            }
        });

        let embeds: Vec<String> = join_all(transfers).await.into_iter().flatten().collect();
        if attempted > 0 {
            tracing::info!(attempted, uploaded = embeds.len(), "Image transfer finished");
        }
        UploadBatch { embeds, attempted }
    }
}
