//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    AgentLoop, ApprovalDecision, ApprovalOutcome, ApprovalPolicy, ApprovalRequest,
    ConfirmationHandler, FnConfirmation, LoopCallbacks, LoopStatus, RunRequest, RunResult,
    RunStatus,
};
pub use crate::config::{ContextMode, LoopConfig, ProviderConfig};
pub use crate::error::{AgentError, Result};
pub use crate::provider::{CompletionInvoker, CompletionRequest, FnInvoker};
pub use crate::tools::{AgentTool, AgentToolParameters, Tool, ToolArguments, ToolRegistry};
pub use crate::types::{GenerationSettings, ResponseItem, ResponseStream, Role, StreamEvent};
pub use crate::util::retry::RetryPolicy;
