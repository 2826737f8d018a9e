//! Conversation state types
//!
//! Everything here lives in process memory only and is lost on restart.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};

/// How long a clarification question stays answerable
pub const CONVERSATION_TTL: TimeDelta = TimeDelta::minutes(5);

// ============================================================================
// Inbound message
// ============================================================================

/// A file attached to an inbound message, not yet downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub id: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub url: String,
}

/// One user turn as delivered by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub text: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

impl InboundMessage {
    #[cfg(test)]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: vec![],
        }
    }

    /// Trimmed text, `None` when absent or blank
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

// ============================================================================
// Pending interactions
// ============================================================================

/// Content awaiting accept / reject / publish-original
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub candidate_text: String,
    pub image_refs: Vec<String>,
}

/// A message whose intent the principal must choose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclearMessage {
    pub original_text: String,
    pub original_message: InboundMessage,
}

/// A fully computed replacement for an existing day's file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub target_date_key: String,
    pub updated_full_text: String,
    /// Token read when the edit was computed; never refreshed before writing
    pub revision_token: String,
    pub explanation: String,
}

/// An instruction waiting on the answer to a clarifying question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub original_instruction: String,
    pub clarification_question: String,
    pub pending_image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= CONVERSATION_TTL
    }
}

// ============================================================================
// Session
// ============================================================================

/// What the principal is currently expected to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingProposalDecision,
    AwaitingEditApproval,
    AwaitingClarification,
    AwaitingUnclearChoice,
}

impl FlowState {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::AwaitingProposalDecision => "awaiting_proposal_decision",
            FlowState::AwaitingEditApproval => "awaiting_edit_approval",
            FlowState::AwaitingClarification => "awaiting_clarification",
            FlowState::AwaitingUnclearChoice => "awaiting_unclear_choice",
        }
    }
}

/// Ephemeral state of the single principal.
///
/// Each slot holds at most one item; creating a new one replaces the old.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalSession {
    pub proposal: Option<Proposal>,
    pub unclear: Option<UnclearMessage>,
    pub pending_edit: Option<PendingEdit>,
    pub conversation: Option<ConversationContext>,
}

impl PrincipalSession {
    /// The clarification context, unless it has expired
    pub fn active_conversation(&self, now: DateTime<Utc>) -> Option<&ConversationContext> {
        self.conversation.as_ref().filter(|c| !c.is_expired(now))
    }

    /// Drop an expired clarification context. Returns whether one was dropped.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> bool {
        if self.conversation.as_ref().is_some_and(|c| c.is_expired(now)) {
            self.conversation = None;
            return true;
        }
        false
    }

    /// Short description of the interaction still awaiting the principal,
    /// given to the classifier as context
    pub fn prior_turn_summary(&self) -> Option<String> {
        if let Some(proposal) = &self.proposal {
            return Some(format!(
                "The assistant offered this draft for approval: {}",
                proposal.candidate_text
            ));
        }
        if let Some(edit) = &self.pending_edit {
            return Some(format!(
                "The assistant proposed an edit to the {} entry: {}",
                edit.target_date_key, edit.explanation
            ));
        }
        self.unclear.as_ref().map(|unclear| {
            format!(
                "The assistant asked whether this was content or an instruction: {}",
                unclear.original_text
            )
        })
    }

    /// Live interactions, or `[Idle]` when nothing is pending
    pub fn flow_states(&self, now: DateTime<Utc>) -> Vec<FlowState> {
        let states: Vec<FlowState> = [
            self.proposal
                .is_some()
                .then_some(FlowState::AwaitingProposalDecision),
            self.pending_edit
                .is_some()
                .then_some(FlowState::AwaitingEditApproval),
            self.active_conversation(now)
                .is_some()
                .then_some(FlowState::AwaitingClarification),
            self.unclear
                .is_some()
                .then_some(FlowState::AwaitingUnclearChoice),
        ]
        .into_iter()
        .flatten()
        .collect();

        if states.is_empty() {
            vec![FlowState::Idle]
        } else {
            states
        }
    }
}

/// Immutable configuration the transition function reads
#[derive(Debug, Clone)]
pub struct BotContext {
    pub principal_id: String,
    /// Days of history offered to the edit call
    pub recent_days: u32,
    /// Offset of the principal's local time
    pub utc_offset: FixedOffset,
}

impl BotContext {
    pub fn new(principal_id: impl Into<String>, recent_days: u32, utc_offset: FixedOffset) -> Self {
        Self {
            principal_id: principal_id.into(),
            recent_days,
            utc_offset,
        }
    }

    pub fn is_principal(&self, sender: &str) -> bool {
        sender == self.principal_id
    }
}
