//! Conversation items exchanged with the model.

use serde::{Deserialize, Serialize};

/// Output marker for a call the user declined.
pub const DENIED_MARKER: &str = "denied";
/// Output marker for a call abandoned by a cancelled run.
pub const ABORTED_MARKER: &str = "aborted";

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
}

/// A single item in the conversation, as produced by the model or the loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: Role,
        content: String,
    },
    FunctionCall {
        name: String,
        /// Raw JSON-encoded arguments, as sent by the model.
        arguments: String,
        call_id: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
    Reasoning {
        text: String,
    },
}

impl ResponseItem {
    pub fn user(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    /// A system notice produced by the loop itself (errors, diagnostics).
    pub fn system(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::FunctionCall {
            name: name.into(),
            arguments: arguments.into(),
            call_id: call_id.into(),
        }
    }

    /// Output of a tool that ran (successfully or not).
    pub fn function_output(call_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.to_string(),
        }
    }

    /// Output recorded in place of a call that was not executed because it was denied.
    pub fn denied_output(call_id: impl Into<String>, explanation: Option<&str>) -> Self {
        let mut body = serde_json::json!({ "status": DENIED_MARKER });
        if let Some(explanation) = explanation {
            body["reason"] = explanation.into();
        }
        Self::function_output(call_id, body)
    }

    /// Output recorded for a call whose run was cancelled before it could be answered.
    pub fn aborted_output(call_id: impl Into<String>) -> Self {
        Self::function_output(call_id, serde_json::json!({ "status": ABORTED_MARKER }))
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::FunctionCall { call_id, .. } | Self::FunctionCallOutput { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Self::FunctionCall { .. })
    }

    /// Whether this is an output item carrying the given status marker.
    pub fn has_output_status(&self, marker: &str) -> bool {
        let Self::FunctionCallOutput { output, .. } = self else {
            return false;
        };
        serde_json::from_str::<serde_json::Value>(output)
            .ok()
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s == marker))
            .unwrap_or(false)
    }

    /// Text content for messages and reasoning items.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Message { content, .. } => Some(content),
            Self::Reasoning { text } => Some(text),
            _ => None,
        }
    }
}
