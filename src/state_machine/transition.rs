//! Pure state transition function
//!
//! Given the session, the fixed context, the current instant and one
//! event, decide the next session and the effects to run. No I/O happens
//! here; network work is requested as [`Job`]s whose results come back
//! as `Completed` events.

use super::effect::{Choice, Effect, Job};
use super::event::{ButtonAction, EditPlan, Event, FlowFailure, Outcome, PreparedPublish};
use super::state::{
    BotContext, ConversationContext, InboundMessage, PendingEdit, PrincipalSession, Proposal,
    UnclearMessage,
};
use crate::llm::{EditDecision, Intent, ReviewDecision};
use crate::normalize::substitute_shortcodes;
use crate::store::{CommitReceipt, DatedFile, StoreError};
use chrono::{DateTime, Utc};
use similar::TextDiff;

pub const UNAUTHORIZED_REPLY: &str = "Sorry, this assistant only works for its owner.";
pub const NOTHING_PENDING: &str = "There's nothing pending for that button anymore.";
pub const EMPTY_TOPIC_REPLY: &str = "What would you like help writing about? Try \"help me write about <topic>\".";
pub const NOTHING_TO_EDIT: &str = "There are no recent entries to edit.";
pub const NO_ENTRIES_TODAY: &str = "No entries yet today.";
pub const IMAGES_DROPPED: &str = "I couldn't upload the attached images, so they were left out.";
pub const NO_IMAGES_PUBLISHED: &str = "I couldn't upload any of the images, so nothing was published.";
pub const STORE_CONFLICT: &str = "has changed since this edit was prepared, so nothing was written. Please send the instruction again.";

pub const HELP_TEXT: &str = "Here's what I can do:
- Send me a thought and I'll publish it to today's entry (I may suggest a cleaner version first).
- Send photos, with or without text, and I'll publish them too.
- Ask me to change something already published, like \"fix the typo in yesterday's post\".
- \"help me write about <topic>\" drafts something for you to approve.
- \"show today\" shows what you've published today.";

const TODAY_PREFIXES: &[&str] = &["show today", "show me today", "what did i write today"];
const CRAFT_PREFIXES: &[&str] = &[
    "help me write about",
    "help me craft about",
    "help me craft",
    "help me write",
];

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_session: PrincipalSession,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    fn new(session: PrincipalSession, effects: Vec<Effect>) -> Self {
        Self {
            new_session: session,
            effects,
        }
    }
}

/// Fixed commands, evaluated before classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    ShowToday,
    /// Topic may be empty
    Craft(&'a str),
    Help,
}

/// Remainder after a case-insensitive, whole-word prefix
fn strip_command<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = text.get(prefix.len()..)?;
    if rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == ':') {
        Some(rest)
    } else {
        None
    }
}

pub fn parse_command(text: &str) -> Option<Command<'_>> {
    let text = text.trim();
    let bare = text.trim_end_matches(['?', '!', '.']);

    if bare.eq_ignore_ascii_case("help") {
        return Some(Command::Help);
    }
    if bare.eq_ignore_ascii_case("today")
        || TODAY_PREFIXES
            .iter()
            .any(|prefix| strip_command(text, prefix).is_some())
    {
        return Some(Command::ShowToday);
    }
    CRAFT_PREFIXES.iter().find_map(|prefix| {
        strip_command(text, prefix).map(|rest| Command::Craft(rest.trim_start_matches([':', ' ']).trim()))
    })
}

/// Instruction text sent when the principal answers a clarifying question
pub fn follow_up_instruction(context: &ConversationContext, reply: &str) -> String {
    format!(
        "Original request: {}\nYou asked: {}\nMy answer: {reply}",
        context.original_instruction, context.clarification_question
    )
}

/// Pure transition function
pub fn transition(
    session: &PrincipalSession,
    context: &BotContext,
    now: DateTime<Utc>,
    event: Event,
) -> TransitionResult {
    // Unauthorized senders never read or touch the session
    match &event {
        Event::Message {
            sender, channel, ..
        } if !context.is_principal(sender) => {
            tracing::warn!(%sender, "Rejected message from unauthorized sender");
            return TransitionResult::new(
                session.clone(),
                vec![Effect::reply(channel, UNAUTHORIZED_REPLY)],
            );
        }
        Event::Button { sender, action, .. } if !context.is_principal(sender) => {
            tracing::warn!(%sender, action = action.action_id(), "Ignored button press from unauthorized sender");
            return TransitionResult::new(session.clone(), vec![]);
        }
        _ => {}
    }

    let mut next = session.clone();
    if next.purge_expired(now) {
        tracing::info!("Clarification context expired");
    }

    let effects = match event {
        Event::Message {
            channel, message, ..
        } => on_message(&mut next, now, &channel, message),
        Event::Button {
            channel,
            action,
            value,
            ..
        } => on_button(&mut next, &channel, action, value),
        Event::Completed { channel, outcome } => on_completed(&mut next, now, &channel, outcome),
    };

    TransitionResult::new(next, effects)
}

// ============================================================================
// Inbound messages
// ============================================================================

fn on_message(
    session: &mut PrincipalSession,
    now: DateTime<Utc>,
    channel: &str,
    message: InboundMessage,
) -> Vec<Effect> {
    let message = InboundMessage {
        text: message
            .body()
            .map(substitute_shortcodes)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        attachments: message.attachments,
    };

    let Some(text) = message.text.clone() else {
        if message.attachments.is_empty() {
            tracing::debug!("Ignoring empty message");
            return vec![];
        }
        // Images carry no ambiguity about intent
        return vec![Effect::spawn(
            channel,
            Job::PreparePublish {
                message,
                restore: None,
            },
        )];
    };

    if let Some(command) = parse_command(&text) {
        return match command {
            Command::ShowToday => vec![Effect::spawn(channel, Job::LoadToday)],
            Command::Help => vec![Effect::reply(channel, HELP_TEXT)],
            Command::Craft("") => vec![Effect::reply(channel, EMPTY_TOPIC_REPLY)],
            Command::Craft(topic) => vec![Effect::spawn(
                channel,
                Job::Craft {
                    topic: topic.to_string(),
                },
            )],
        };
    }

    if session.active_conversation(now).is_some() {
        if let Some(conversation) = session.conversation.take() {
            return vec![Effect::spawn(
                channel,
                Job::PlanEdit {
                    instruction: follow_up_instruction(&conversation, &text),
                    attachments: message.attachments,
                    carried_image_ref: conversation.pending_image_ref.clone(),
                    restore: None,
                    resume: Some(conversation),
                },
            )];
        }
    }

    vec![Effect::spawn(
        channel,
        Job::Classify {
            message,
            prior_turn: session.prior_turn_summary(),
        },
    )]
}

// ============================================================================
// Button presses
// ============================================================================

fn on_button(
    session: &mut PrincipalSession,
    channel: &str,
    action: ButtonAction,
    value: Option<String>,
) -> Vec<Effect> {
    let nothing_pending = || {
        tracing::info!(action = action.action_id(), "Button pressed with nothing pending");
        vec![Effect::reply(channel, NOTHING_PENDING)]
    };

    match action {
        ButtonAction::AcceptProposal => match session.proposal.take() {
            Some(proposal) => vec![Effect::spawn(
                channel,
                Job::Commit {
                    text: Some(proposal.candidate_text),
                    image_refs: proposal.image_refs,
                },
            )],
            None => nothing_pending(),
        },
        ButtonAction::RejectProposal => match session.proposal.take() {
            Some(_) => vec![Effect::reply(channel, "Discarded.")],
            None => nothing_pending(),
        },
        ButtonAction::PublishOriginal => {
            if session.proposal.is_none() {
                return nothing_pending();
            }
            let Some(original) = value.filter(|v| !v.trim().is_empty()) else {
                tracing::warn!("publish_original pressed without the original text");
                return vec![Effect::reply(
                    channel,
                    "That button lost the original text. Please use one of the other choices.",
                )];
            };
            let image_refs = session
                .proposal
                .take()
                .map(|p| p.image_refs)
                .unwrap_or_default();
            vec![Effect::spawn(
                channel,
                Job::Commit {
                    text: Some(original),
                    image_refs,
                },
            )]
        }
        ButtonAction::TreatAsContent => match session.unclear.take() {
            Some(unclear) => vec![Effect::spawn(
                channel,
                Job::PreparePublish {
                    message: unclear.original_message.clone(),
                    restore: Some(unclear),
                },
            )],
            None => nothing_pending(),
        },
        ButtonAction::TreatAsInstruction => match session.unclear.take() {
            Some(unclear) => vec![Effect::spawn(
                channel,
                Job::PlanEdit {
                    instruction: unclear.original_text.clone(),
                    attachments: unclear.original_message.attachments.clone(),
                    carried_image_ref: None,
                    restore: Some(unclear),
                    resume: None,
                },
            )],
            None => nothing_pending(),
        },
        ButtonAction::ApproveEdit => match session.pending_edit.take() {
            Some(edit) => vec![Effect::spawn(channel, Job::WriteEdit { edit })],
            None => nothing_pending(),
        },
        ButtonAction::RejectEdit => match session.pending_edit.take() {
            Some(_) => vec![Effect::reply(channel, "Edit discarded.")],
            None => nothing_pending(),
        },
    }
}

// ============================================================================
// Completed jobs
// ============================================================================

fn on_completed(
    session: &mut PrincipalSession,
    now: DateTime<Utc>,
    channel: &str,
    outcome: Outcome,
) -> Vec<Effect> {
    match outcome {
        Outcome::TodayLoaded(result) => today_loaded(channel, result),
        Outcome::Classified { message, intent } => classified(session, channel, message, intent),
        Outcome::PublishPrepared(prepared) => publish_prepared(session, channel, prepared),
        Outcome::Crafted(Ok(text)) => {
            replace_proposal(
                session,
                Proposal {
                    candidate_text: text.clone(),
                    image_refs: vec![],
                },
            );
            vec![Effect::ask(
                channel,
                format!("Here's a draft:\n\n{text}"),
                vec![
                    Choice::new("Publish it", ButtonAction::AcceptProposal),
                    Choice::new("Discard", ButtonAction::RejectProposal),
                ],
            )]
        }
        Outcome::Crafted(Err(e)) => {
            tracing::warn!(error = %e, "Craft failed");
            vec![Effect::reply(channel, format!("I couldn't draft that: {e}"))]
        }
        Outcome::EditPlanned {
            instruction,
            result,
            restore,
            resume,
        } => match result {
            Ok(plan) => edit_planned(session, now, channel, instruction, plan),
            Err(e) => {
                restore_unclear(session, restore);
                restore_conversation(session, now, resume);
                match e {
                    FlowFailure::NothingToEdit => vec![Effect::reply(channel, NOTHING_TO_EDIT)],
                    other => {
                        tracing::warn!(error = %other, "Edit planning failed");
                        vec![Effect::reply(
                            channel,
                            format!("I couldn't work out that edit: {other}"),
                        )]
                    }
                }
            }
        },
        Outcome::Committed(result) => committed(channel, result),
        Outcome::EditWritten { date_key, result } => edit_written(channel, &date_key, result),
    }
}

fn today_loaded(channel: &str, result: Result<Option<DatedFile>, StoreError>) -> Vec<Effect> {
    match result {
        Ok(Some(file)) => vec![Effect::reply(channel, file.content)],
        Ok(None) => vec![Effect::reply(channel, NO_ENTRIES_TODAY)],
        Err(e) => {
            tracing::warn!(error = %e, "Loading today's file failed");
            vec![Effect::reply(
                channel,
                format!("I couldn't load today's entries: {e}"),
            )]
        }
    }
}

fn classified(
    session: &mut PrincipalSession,
    channel: &str,
    message: InboundMessage,
    intent: Intent,
) -> Vec<Effect> {
    match intent {
        Intent::Content => vec![Effect::spawn(
            channel,
            Job::PreparePublish {
                message,
                restore: None,
            },
        )],
        Intent::Instruction => vec![Effect::spawn(
            channel,
            Job::PlanEdit {
                instruction: message.text.clone().unwrap_or_default(),
                attachments: message.attachments,
                carried_image_ref: None,
                restore: None,
                resume: None,
            },
        )],
        Intent::Ambiguous => {
            if session.unclear.is_some() {
                tracing::info!("Replacing unresolved unclear message");
            }
            session.unclear = Some(UnclearMessage {
                original_text: message.text.clone().unwrap_or_default(),
                original_message: message,
            });
            vec![Effect::ask(
                channel,
                "Should I publish this, or is it a request to change something already published?",
                vec![
                    Choice::new("Publish it", ButtonAction::TreatAsContent),
                    Choice::new("It's an edit request", ButtonAction::TreatAsInstruction),
                ],
            )]
        }
    }
}

fn publish_prepared(
    session: &mut PrincipalSession,
    channel: &str,
    prepared: PreparedPublish,
) -> Vec<Effect> {
    let images_dropped = prepared.attempted_images > 0 && prepared.image_refs.is_empty();

    let (Some(original), Some(review)) = (prepared.original_text, prepared.review) else {
        // Image-only publish
        if prepared.image_refs.is_empty() {
            tracing::warn!(attempted = prepared.attempted_images, "No images to publish");
            return vec![Effect::reply(channel, NO_IMAGES_PUBLISHED)];
        }
        return vec![Effect::spawn(
            channel,
            Job::Commit {
                text: None,
                image_refs: prepared.image_refs,
            },
        )];
    };

    let review = match review {
        Ok(review) => review,
        Err(e) => {
            tracing::warn!(error = %e, "Review failed");
            restore_unclear(session, prepared.restore);
            return vec![Effect::reply(
                channel,
                format!("I couldn't review that, so nothing was published: {e}"),
            )];
        }
    };

    let mut effects = Vec::new();
    if images_dropped {
        tracing::warn!(attempted = prepared.attempted_images, "All image transfers failed; publishing text only");
        effects.push(Effect::reply(channel, IMAGES_DROPPED));
    }

    match review.decision {
        ReviewDecision::Publish => effects.push(Effect::spawn(
            channel,
            Job::Commit {
                text: Some(review.text),
                image_refs: prepared.image_refs,
            },
        )),
        ReviewDecision::Suggest => {
            let mut text = format!("Suggested version:\n\n{}", review.text);
            if !review.explanation.is_empty() {
                text.push_str(&format!("\n\n_{}_", review.explanation));
            }
            replace_proposal(
                session,
                Proposal {
                    candidate_text: review.text,
                    image_refs: prepared.image_refs,
                },
            );
            effects.push(Effect::ask(
                channel,
                text,
                vec![
                    Choice::new("Use suggestion", ButtonAction::AcceptProposal),
                    Choice::new("Publish original", ButtonAction::PublishOriginal)
                        .with_value(original),
                    Choice::new("Discard", ButtonAction::RejectProposal),
                ],
            ));
        }
    }
    effects
}

fn edit_planned(
    session: &mut PrincipalSession,
    now: DateTime<Utc>,
    channel: &str,
    instruction: String,
    plan: EditPlan,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    if plan.images_dropped {
        tracing::warn!("All image transfers failed; planning the edit without them");
        effects.push(Effect::reply(channel, IMAGES_DROPPED));
    }
    effects.extend(edit_decided(session, now, channel, instruction, plan));
    effects
}

fn edit_decided(
    session: &mut PrincipalSession,
    now: DateTime<Utc>,
    channel: &str,
    instruction: String,
    plan: EditPlan,
) -> Vec<Effect> {
    match plan.decision {
        EditDecision::Edit {
            date_key,
            full_text,
            explanation,
            warning,
        } => {
            let Some(file) = plan.recent.iter().find(|f| f.date_key == date_key) else {
                tracing::error!(%date_key, "Edit names a day that was not among the fetched files");
                return vec![Effect::reply(
                    channel,
                    format!("Something went wrong: the edit refers to {date_key}, which isn't one of your recent entries. Nothing was changed."),
                )];
            };

            let text = edit_preview(file, &full_text, &explanation, warning.as_deref());
            if session.pending_edit.is_some() {
                tracing::info!("Replacing unapproved pending edit");
            }
            session.pending_edit = Some(PendingEdit {
                target_date_key: date_key,
                updated_full_text: full_text,
                revision_token: file.revision_token.clone(),
                explanation,
            });
            vec![Effect::ask(
                channel,
                text,
                vec![
                    Choice::new("Apply edit", ButtonAction::ApproveEdit),
                    Choice::new("Cancel", ButtonAction::RejectEdit),
                ],
            )]
        }
        EditDecision::Unclear { question } => {
            session.conversation = Some(ConversationContext {
                original_instruction: instruction,
                clarification_question: question.clone(),
                pending_image_ref: plan.image_ref,
                created_at: now,
            });
            vec![Effect::reply(channel, question)]
        }
        EditDecision::Unsupported { reason } => vec![Effect::reply(channel, reason)],
    }
}

fn edit_preview(file: &DatedFile, full_text: &str, explanation: &str, warning: Option<&str>) -> String {
    let diff = TextDiff::from_lines(file.content.as_str(), full_text)
        .unified_diff()
        .context_radius(2)
        .header(&file.date_key, &file.date_key)
        .to_string();

    let mut text = format!("Proposed edit to {}", file.date_key);
    if !explanation.is_empty() {
        text.push_str(&format!(": {explanation}"));
    }
    if let Some(warning) = warning {
        text.push_str(&format!("\n:warning: {warning}"));
    }
    text.push_str(&format!("\n```\n{diff}```"));
    text
}

fn committed(channel: &str, result: Result<CommitReceipt, StoreError>) -> Vec<Effect> {
    match result {
        Ok(receipt) => vec![Effect::reply(
            channel,
            format!("Published to {}.", receipt.date_key),
        )],
        Err(e) if e.is_conflict() => {
            tracing::warn!(error = %e, "Publish lost a race with another writer");
            vec![Effect::reply(
                channel,
                "Today's entry changed while I was publishing, so nothing was written. Please try again.",
            )]
        }
        Err(e) => {
            tracing::warn!(error = %e, "Publish failed");
            vec![Effect::reply(channel, format!("I couldn't publish that: {e}"))]
        }
    }
}

fn edit_written(channel: &str, date_key: &str, result: Result<(), StoreError>) -> Vec<Effect> {
    match result {
        Ok(()) => vec![Effect::reply(channel, format!("Updated {date_key}."))],
        Err(e) if e.is_conflict() => {
            tracing::warn!(%date_key, error = %e, "Edit rejected: stale revision token");
            vec![Effect::reply(channel, format!("{date_key} {STORE_CONFLICT}"))]
        }
        Err(e) => {
            tracing::warn!(%date_key, error = %e, "Edit write failed");
            vec![Effect::reply(
                channel,
                format!("I couldn't save the edit to {date_key}: {e}"),
            )]
        }
    }
}

fn replace_proposal(session: &mut PrincipalSession, proposal: Proposal) {
    if session.proposal.is_some() {
        tracing::info!("Replacing unresolved proposal");
    }
    session.proposal = Some(proposal);
}

/// Put an unclear message back after a failed resolution, unless replaced
fn restore_unclear(session: &mut PrincipalSession, restore: Option<UnclearMessage>) {
    if session.unclear.is_none() {
        session.unclear = restore;
    }
}

/// Reopen a clarification whose follow-up failed, while it is still live
fn restore_conversation(
    session: &mut PrincipalSession,
    now: DateTime<Utc>,
    resume: Option<ConversationContext>,
) {
    if session.conversation.is_none() {
        session.conversation = resume.filter(|c| !c.is_expired(now));
    }
}
