//! Bot runtime executor

use super::traits::{Clock, ContentStore, Gateway, Transport};
use crate::images::ImagePipeline;
use crate::llm::Intent;
use crate::state_machine::event::{EditPlan, FlowFailure, PreparedPublish};
use crate::state_machine::state::UnclearMessage;
use crate::state_machine::{
    transition, AttachmentRef, BotContext, Effect, Event, InboundMessage, Job, Outcome,
    PrincipalSession,
};
use crate::store::{append_entry, compose_entry, date_key, format_date_key, local_date, recent_files};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Collaborators shared with background jobs
pub struct Services<T: ?Sized, G: ?Sized, S: ?Sized> {
    pub transport: Arc<T>,
    pub gateway: Arc<G>,
    pub store: Arc<S>,
    pub images: Arc<ImagePipeline>,
}

impl<T: ?Sized, G: ?Sized, S: ?Sized> Clone for Services<T, G, S> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            gateway: Arc::clone(&self.gateway),
            store: Arc::clone(&self.store),
            images: Arc::clone(&self.images),
        }
    }
}

/// Owns the principal's session and applies events to it one at a time.
///
/// Replies are sent inline; jobs run as background tasks that report back
/// through the same event channel, so network waits interleave while state
/// changes stay serialized.
pub struct BotRuntime<T, G, S, C>
where
    T: Transport + ?Sized + 'static,
    G: Gateway + ?Sized + 'static,
    S: ContentStore + ?Sized + 'static,
    C: Clock,
{
    context: BotContext,
    session: PrincipalSession,
    services: Services<T, G, S>,
    clock: C,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
}

impl<T, G, S, C> BotRuntime<T, G, S, C>
where
    T: Transport + ?Sized + 'static,
    G: Gateway + ?Sized + 'static,
    S: ContentStore + ?Sized + 'static,
    C: Clock,
{
    pub fn new(
        context: BotContext,
        services: Services<T, G, S>,
        clock: C,
        event_rx: mpsc::Receiver<Event>,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            context,
            session: PrincipalSession::default(),
            services,
            clock,
            event_rx,
            event_tx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(principal = %self.context.principal_id, "Starting bot runtime");

        while let Some(event) = self.event_rx.recv().await {
            self.process_event(event).await;
        }

        tracing::info!("Bot runtime stopped");
    }

    async fn process_event(&mut self, event: Event) {
        let now = self.clock.now();
        let result = transition(&self.session, &self.context, now, event);

        let old_session = std::mem::replace(&mut self.session, result.new_session);
        let before = old_session.flow_states(now);
        let after = self.session.flow_states(now);
        if before != after {
            tracing::info!(
                from = ?before.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                to = ?after.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                "Flow state changed"
            );
        }

        for effect in result.effects {
            self.execute_effect(effect, now).await;
        }
    }

    async fn execute_effect(&self, effect: Effect, now: DateTime<Utc>) {
        match effect {
            Effect::Reply(outbound) => {
                if let Err(e) = self.services.transport.send(&outbound).await {
                    tracing::error!(channel = %outbound.channel, error = %e, "Failed to send reply");
                }
            }
            Effect::Spawn { channel, job } => {
                let services = self.services.clone();
                let context = self.context.clone();
                let event_tx = self.event_tx.clone();
                let name = job.name();

                tokio::spawn(async move {
                    tracing::debug!(job = name, "Running job (background)");
                    let outcome = run_job(&services, &context, job, now).await;
                    if event_tx
                        .send(Event::Completed { channel, outcome })
                        .await
                        .is_err()
                    {
                        tracing::warn!(job = name, "Runtime stopped before job completed");
                    }
                });
            }
        }
    }
}

/// Perform one job against the collaborators
pub async fn run_job<T, G, S>(
    services: &Services<T, G, S>,
    context: &BotContext,
    job: Job,
    now: DateTime<Utc>,
) -> Outcome
where
    T: Transport + ?Sized,
    G: Gateway + ?Sized,
    S: ContentStore + ?Sized,
{
    let offset = context.utc_offset;
    match job {
        Job::LoadToday => {
            Outcome::TodayLoaded(services.store.read(&date_key(now, offset)).await)
        }

        Job::Classify {
            message,
            prior_turn,
        } => {
            let text = message.body().unwrap_or_default();
            let intent = match services.gateway.classify(text, prior_turn.as_deref()).await {
                Ok(intent) => intent,
                Err(e) => {
                    tracing::warn!(error = %e, "Classification failed; treating as content");
                    Intent::Content
                }
            };
            tracing::info!(?intent, "Classified message");
            Outcome::Classified { message, intent }
        }

        Job::PreparePublish { message, restore } => {
            Outcome::PublishPrepared(prepare_publish(services, message, restore, now).await)
        }

        Job::Craft { topic } => Outcome::Crafted(services.gateway.craft(&topic).await),

        Job::PlanEdit {
            instruction,
            attachments,
            carried_image_ref,
            restore,
            resume,
        } => {
            let result = plan_edit(
                services,
                context,
                &instruction,
                &attachments,
                carried_image_ref,
                now,
            )
            .await;
            Outcome::EditPlanned {
                instruction,
                result,
                restore,
                resume,
            }
        }

        Job::Commit { text, image_refs } => {
            let entry = compose_entry(text.as_deref(), &image_refs);
            let key = date_key(now, offset);
            Outcome::Committed(append_entry(services.store.as_ref(), &key, &entry).await)
        }

        Job::WriteEdit { edit } => {
            let message = format!("Edit entry for {}", edit.target_date_key);
            let result = services
                .store
                .write(
                    &edit.target_date_key,
                    &edit.updated_full_text,
                    &message,
                    Some(&edit.revision_token),
                )
                .await;
            if let Ok(revision) = &result {
                tracing::info!(date_key = %edit.target_date_key, %revision, "Applied edit");
            }
            Outcome::EditWritten {
                date_key: edit.target_date_key,
                result: result.map(|_| ()),
            }
        }
    }
}

/// Review the text and transfer images concurrently
async fn prepare_publish<T, G, S>(
    services: &Services<T, G, S>,
    message: InboundMessage,
    restore: Option<UnclearMessage>,
    now: DateTime<Utc>,
) -> PreparedPublish
where
    T: Transport + ?Sized,
    G: Gateway + ?Sized,
    S: ContentStore + ?Sized,
{
    let original_text = message.body().map(ToString::to_string);

    let review = async {
        match original_text.as_deref() {
            Some(text) => Some(services.gateway.review(text).await),
            None => None,
        }
    };
    let upload = services.images.transfer(
        services.transport.as_ref(),
        services.store.as_ref(),
        &message.attachments,
        now,
    );
    let (review, batch) = tokio::join!(review, upload);

    PreparedPublish {
        original_text,
        review,
        image_refs: batch.embeds,
        attempted_images: batch.attempted,
        restore,
    }
}

async fn plan_edit<T, G, S>(
    services: &Services<T, G, S>,
    context: &BotContext,
    instruction: &str,
    attachments: &[AttachmentRef],
    carried_image_ref: Option<String>,
    now: DateTime<Utc>,
) -> Result<EditPlan, FlowFailure>
where
    T: Transport + ?Sized,
    G: Gateway + ?Sized,
    S: ContentStore + ?Sized,
{
    let mut images_dropped = false;
    let image_ref = if attachments.is_empty() {
        carried_image_ref
    } else {
        let batch = services
            .images
            .transfer(
                services.transport.as_ref(),
                services.store.as_ref(),
                attachments,
                now,
            )
            .await;
        if batch.embeds.is_empty() {
            images_dropped = batch.attempted > 0;
            carried_image_ref
        } else {
            Some(batch.embeds.join("\n\n"))
        }
    };

    let today = local_date(now, context.utc_offset);
    let recent = recent_files(services.store.as_ref(), today, context.recent_days).await?;
    if recent.is_empty() {
        return Err(FlowFailure::NothingToEdit);
    }

    let decision = services
        .gateway
        .execute_edit(
            instruction,
            &recent,
            image_ref.as_deref(),
            &format_date_key(today),
        )
        .await?;

    Ok(EditPlan {
        recent,
        image_ref,
        images_dropped,
        decision,
    })
}
