//! Agent loop primitives (runs, approvals, lifecycle, conversation state).

pub mod approvals;
pub mod conversation;
pub mod events;
mod lifecycle;
pub mod runner;
mod stream_processor;
pub mod types;

pub use approvals::{
    ApprovalDecision, ApprovalOutcome, ApprovalPolicy, ApprovalRequest, ConfirmationHandler,
    FnConfirmation,
};
pub use conversation::ConversationState;
pub use events::{ItemSink, LoadingSink, LoopCallbacks, ResponseIdSink};
pub use runner::{AgentLoop, AgentLoopBuilder};
pub use types::{LoopStatus, RunId, RunRequest, RunResult, RunState, RunStatus};
