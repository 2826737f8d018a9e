//! Runtime for executing the conversation orchestrator

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{BotRuntime, Services};
pub use traits::*;

use crate::images::ImagePipeline;
use crate::llm::LlmGateway;
use crate::store::GitHubStore;
use crate::transport::SlackTransport;
use std::sync::Arc;

/// Collaborators wired to the real services
pub type ProductionServices = Services<SlackTransport, LlmGateway, GitHubStore>;

/// Runtime with concrete production implementations
pub type ProductionRuntime = BotRuntime<SlackTransport, LlmGateway, GitHubStore, SystemClock>;

impl ProductionServices {
    pub fn production(
        transport: Arc<SlackTransport>,
        gateway: LlmGateway,
        store: GitHubStore,
        images: ImagePipeline,
    ) -> Self {
        Self {
            transport,
            gateway: Arc::new(gateway),
            store: Arc::new(store),
            images: Arc::new(images),
        }
    }
}
