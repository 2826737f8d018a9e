//! Events that can occur in a conversation

use super::state::{ConversationContext, InboundMessage, UnclearMessage};
use crate::llm::{EditDecision, GatewayError, Intent, Review};
use crate::store::{CommitReceipt, DatedFile, StoreError};
use thiserror::Error;

/// Interactive choices the principal can press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    AcceptProposal,
    RejectProposal,
    PublishOriginal,
    TreatAsContent,
    TreatAsInstruction,
    ApproveEdit,
    RejectEdit,
}

impl ButtonAction {
    pub const ALL: [ButtonAction; 7] = [
        ButtonAction::AcceptProposal,
        ButtonAction::RejectProposal,
        ButtonAction::PublishOriginal,
        ButtonAction::TreatAsContent,
        ButtonAction::TreatAsInstruction,
        ButtonAction::ApproveEdit,
        ButtonAction::RejectEdit,
    ];

    /// Stable identifier carried by the transport
    pub fn action_id(self) -> &'static str {
        match self {
            ButtonAction::AcceptProposal => "accept_proposal",
            ButtonAction::RejectProposal => "reject_proposal",
            ButtonAction::PublishOriginal => "publish_original",
            ButtonAction::TreatAsContent => "treat_as_content",
            ButtonAction::TreatAsInstruction => "treat_as_instruction",
            ButtonAction::ApproveEdit => "approve_edit",
            ButtonAction::RejectEdit => "reject_edit",
        }
    }

    pub fn from_action_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.action_id() == id)
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// A user turn
    Message {
        sender: String,
        channel: String,
        message: InboundMessage,
    },
    /// A button press
    Button {
        sender: String,
        channel: String,
        action: ButtonAction,
        value: Option<String>,
    },
    /// Background work finished
    Completed { channel: String, outcome: Outcome },
}

/// Results of background jobs
#[derive(Debug, Clone)]
pub enum Outcome {
    TodayLoaded(Result<Option<DatedFile>, StoreError>),
    /// Classification never fails; gateway errors are reported as `Content`
    Classified {
        message: InboundMessage,
        intent: Intent,
    },
    PublishPrepared(PreparedPublish),
    Crafted(Result<String, GatewayError>),
    EditPlanned {
        instruction: String,
        result: Result<EditPlan, FlowFailure>,
        restore: Option<UnclearMessage>,
        resume: Option<ConversationContext>,
    },
    Committed(Result<CommitReceipt, StoreError>),
    EditWritten {
        date_key: String,
        result: Result<(), StoreError>,
    },
}

/// Joined result of review and image transfer
#[derive(Debug, Clone)]
pub struct PreparedPublish {
    pub original_text: Option<String>,
    /// `None` when there was no text to review
    pub review: Option<Result<Review, GatewayError>>,
    /// Embeds of images that uploaded successfully, in attachment order
    pub image_refs: Vec<String>,
    /// Supported image attachments that were attempted
    pub attempted_images: usize,
    pub restore: Option<UnclearMessage>,
}

/// Gateway answer to an edit instruction, with the files it was computed from
#[derive(Debug, Clone)]
pub struct EditPlan {
    pub recent: Vec<DatedFile>,
    pub image_ref: Option<String>,
    /// New attachments were sent but none could be uploaded
    pub images_dropped: bool,
    pub decision: EditDecision,
}

/// Failures of the edit-planning job
#[derive(Debug, Clone, Error)]
pub enum FlowFailure {
    #[error("no recent entries to edit")]
    NothingToEdit,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
