//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::llm::{EditDecision, GatewayError, Intent, Review};
use crate::state_machine::{AttachmentRef, Outbound};
use crate::store::{DatedFile, StoreError};
use crate::transport::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Version-controlled storage of dated files and images
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Read one day's file, `None` when the day has no entries
    async fn read(&self, date_key: &str) -> Result<Option<DatedFile>, StoreError>;

    /// Write a day's file and return its new revision token.
    ///
    /// Without `expected_revision` the file must not exist yet; with one the
    /// write is a compare-and-swap against that token.
    async fn write(
        &self,
        date_key: &str,
        full_text: &str,
        message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Store image bytes under the image directory
    async fn write_image(&self, file_name: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Language model calls the orchestrator relies on
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn classify(&self, text: &str, prior_turn: Option<&str>) -> Result<Intent, GatewayError>;

    async fn review(&self, text: &str) -> Result<Review, GatewayError>;

    /// Freeform draft on a topic
    async fn craft(&self, topic: &str) -> Result<String, GatewayError>;

    async fn execute_edit(
        &self,
        instruction: &str,
        recent: &[DatedFile],
        image_ref: Option<&str>,
        today: &str,
    ) -> Result<EditDecision, GatewayError>;
}

/// Chat platform connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError>;

    /// Fetch the bytes of an inbound attachment
    async fn download(&self, attachment: &AttachmentRef) -> Result<Vec<u8>, TransportError>;
}

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ContentStore + ?Sized> ContentStore for Arc<T> {
    async fn read(&self, date_key: &str) -> Result<Option<DatedFile>, StoreError> {
        (**self).read(date_key).await
    }

    async fn write(
        &self,
        date_key: &str,
        full_text: &str,
        message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, StoreError> {
        (**self)
            .write(date_key, full_text, message, expected_revision)
            .await
    }

    async fn write_image(&self, file_name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).write_image(file_name, bytes).await
    }
}

#[async_trait]
impl<T: Gateway + ?Sized> Gateway for Arc<T> {
    async fn classify(&self, text: &str, prior_turn: Option<&str>) -> Result<Intent, GatewayError> {
        (**self).classify(text, prior_turn).await
    }

    async fn review(&self, text: &str) -> Result<Review, GatewayError> {
        (**self).review(text).await
    }

    async fn craft(&self, topic: &str) -> Result<String, GatewayError> {
        (**self).craft(topic).await
    }

    async fn execute_edit(
        &self,
        instruction: &str,
        recent: &[DatedFile],
        image_ref: Option<&str>,
        today: &str,
    ) -> Result<EditDecision, GatewayError> {
        (**self)
            .execute_edit(instruction, recent, image_ref, today)
            .await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn download(&self, attachment: &AttachmentRef) -> Result<Vec<u8>, TransportError> {
        (**self).download(attachment).await
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
