//! Core conversation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.

pub mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::{Choice, Effect, Job, Outbound};
pub use event::{ButtonAction, Event, Outcome};
pub use state::{AttachmentRef, BotContext, InboundMessage, PrincipalSession};
pub use transition::transition;
