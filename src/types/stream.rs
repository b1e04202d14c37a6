//! Streaming types.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::item::ResponseItem;
use crate::error::AgentError;

/// Token usage reported with a completed response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// One event from a single completion call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The remote side accepted the request and assigned an id.
    Created { response_id: String },
    /// A fully formed output item.
    Item { item: ResponseItem },
    /// Terminal marker; the response is complete.
    Completed {
        response_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl StreamEvent {
    pub fn item(item: ResponseItem) -> Self {
        Self::Item { item }
    }

    pub fn completed(response_id: impl Into<String>) -> Self {
        Self::Completed {
            response_id: response_id.into(),
            usage: None,
        }
    }
}

/// The stream returned by a completion invoker.
pub type ResponseStream = BoxStream<'static, Result<StreamEvent, AgentError>>;
