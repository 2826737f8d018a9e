//! Effects produced by state transitions

use super::event::ButtonAction;
use super::state::{AttachmentRef, ConversationContext, InboundMessage, PendingEdit, UnclearMessage};

/// An interactive choice attached to an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub action: ButtonAction,
    /// Opaque payload returned with the press
    pub value: Option<String>,
}

impl Choice {
    pub fn new(label: impl Into<String>, action: ButtonAction) -> Self {
        Self {
            label: label.into(),
            action,
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// A message to the principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub channel: String,
    pub text: String,
    pub choices: Vec<Choice>,
}

/// Background work; each job reports back with one `Completed` event
#[derive(Debug, Clone)]
pub enum Job {
    LoadToday,
    Classify {
        message: InboundMessage,
        /// What the principal was last asked to resolve, if anything
        prior_turn: Option<String>,
    },
    /// Review text and upload images concurrently
    PreparePublish {
        message: InboundMessage,
        restore: Option<UnclearMessage>,
    },
    Craft {
        topic: String,
    },
    /// Upload any new image, fetch recent files and ask for an edit
    PlanEdit {
        instruction: String,
        attachments: Vec<AttachmentRef>,
        carried_image_ref: Option<String>,
        restore: Option<UnclearMessage>,
        /// Clarification consumed by a follow-up, reopened if planning fails
        resume: Option<ConversationContext>,
    },
    /// Append an entry to today's file
    Commit {
        text: Option<String>,
        image_refs: Vec<String>,
    },
    /// Replace a day's file using the edit's captured revision token
    WriteEdit {
        edit: PendingEdit,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::LoadToday => "load_today",
            Job::Classify { .. } => "classify",
            Job::PreparePublish { .. } => "prepare_publish",
            Job::Craft { .. } => "craft",
            Job::PlanEdit { .. } => "plan_edit",
            Job::Commit { .. } => "commit",
            Job::WriteEdit { .. } => "write_edit",
        }
    }
}

/// Effects to be executed after state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a message to the principal
    Reply(Outbound),
    /// Start background work
    Spawn { channel: String, job: Job },
}

impl Effect {
    pub fn reply(channel: &str, text: impl Into<String>) -> Self {
        Effect::Reply(Outbound {
            channel: channel.to_string(),
            text: text.into(),
            choices: vec![],
        })
    }

    pub fn ask(channel: &str, text: impl Into<String>, choices: Vec<Choice>) -> Self {
        Effect::Reply(Outbound {
            channel: channel.to_string(),
            text: text.into(),
            choices,
        })
    }

    pub fn spawn(channel: &str, job: Job) -> Self {
        Effect::Spawn {
            channel: channel.to_string(),
            job,
        }
    }
}
