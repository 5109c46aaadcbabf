//! Lead conversation model and state machine.

pub mod locks;
pub mod model;
pub mod state;

pub use locks::LeadLocks;
pub use model::{
    ActionStatus, ConversationMessage, ConversationState, Event, EventKind, FailureCause, Lead,
    MessageDirection, NewLead, OutboundAction, ReplyClassification, StaleReason,
    TransitionRecord,
};
pub use state::{Decision, Resolution, TimerCommand, TransitionContext, transition};
