//! Daybook - conversational publishing assistant
//!
//! Turns direct messages from a single owner into dated entries in a git
//! repository, with language-model review, edits and clarification.

mod config;
mod images;
mod llm;
mod normalize;
mod runtime;
mod state_machine;
mod store;
mod transport;

use config::Config;
use images::ImagePipeline;
use llm::{AnthropicService, LlmGateway, LlmService, LoggingService};
use runtime::{BotRuntime, ProductionRuntime, ProductionServices, SystemClock};
use state_machine::BotContext;
use std::sync::Arc;
use store::GitHubStore;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::SlackTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "daybook=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        repo = %format!("{}/{}", config.github.owner, config.github.repo),
        branch = %config.github.branch,
        model = %config.model,
        gateway = config.llm_gateway.is_some(),
        utc_offset = %config.utc_offset,
        "Configuration loaded"
    );

    // Language model
    let anthropic: Arc<dyn LlmService> = Arc::new(AnthropicService::new(
        config.anthropic_api_key.clone(),
        config.model.clone(),
        config.llm_gateway.as_deref(),
    )?);
    let gateway = LlmGateway::new(Arc::new(LoggingService::new(anthropic)));

    // Content store and chat transport
    let store = GitHubStore::new(config.github.clone())?;
    let transport = Arc::new(SlackTransport::new(config.slack.clone())?);
    let images = ImagePipeline::new(config.image_url_prefix.clone(), config.utc_offset);

    let (event_tx, event_rx) = mpsc::channel(64);

    let listener = Arc::clone(&transport);
    let listener_tx = event_tx.clone();
    tokio::spawn(async move {
        listener.listen(listener_tx).await;
    });

    let context = BotContext::new(config.principal_id, config.recent_days, config.utc_offset);
    let services = ProductionServices::production(transport, gateway, store, images);
    let runtime: ProductionRuntime =
        BotRuntime::new(context, services, SystemClock, event_rx, event_tx);

    runtime.run().await;
    Ok(())
}
