//! Tool system for function calling.

pub mod arguments;
pub mod builtin;
pub mod tool;
pub mod types;

pub use arguments::ToolArguments;
pub use tool::{AgentTool, Tool, ToolExecutionContext, ToolRegistry};
pub use types::AgentToolParameters;
