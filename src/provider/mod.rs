//! Completion invoker trait and implementations.
//!
//! The agent loop never talks HTTP itself; it drives a [`CompletionInvoker`]
//! that turns one [`CompletionRequest`] into a [`ResponseStream`].

pub mod http;

#[cfg(feature = "openai")]
pub mod openai_responses;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::error::AgentError;
use crate::types::{GenerationSettings, ResponseItem, ResponseStream};

/// One request sent to the remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    pub input: Vec<ResponseItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub settings: GenerationSettings,
}

/// Tool definition sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Performs a single exchange with the remote model.
///
/// Implementations should observe `cancel` for any work they spawn; the loop
/// also drops the returned future and stream as soon as the token fires.
#[async_trait]
pub trait CompletionInvoker: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "custom"
    }

    async fn invoke(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, AgentError>;
}

type InvokeHandler = dyn Fn(
        CompletionRequest,
        CancellationToken,
    ) -> futures::future::BoxFuture<'static, Result<ResponseStream, AgentError>>
    + Send
    + Sync;

/// Closure-based invoker.
#[derive(Clone)]
pub struct FnInvoker {
    handler: Arc<InvokeHandler>,
}

impl FnInvoker {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(CompletionRequest, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream, AgentError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |request, cancel| Box::pin(handler(request, cancel))),
        }
    }
}

#[async_trait]
impl CompletionInvoker for FnInvoker {
    async fn invoke(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, AgentError> {
        (self.handler)(request.clone(), cancel).await
    }
}

impl std::fmt::Debug for FnInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnInvoker").finish_non_exhaustive()
    }
}

/// Create the default network invoker from provider settings.
#[allow(unused_variables)]
pub fn create_invoker(config: &ProviderConfig) -> Result<Arc<dyn CompletionInvoker>, AgentError> {
    #[cfg(feature = "openai")]
    {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Configuration("Missing OPENAI_API_KEY".into()))?;
        Ok(Arc::new(openai_responses::OpenAiResponsesInvoker::new(
            api_key,
            config.base_url.clone(),
        )))
    }
    #[cfg(not(feature = "openai"))]
    {
        Err(AgentError::Configuration(
            "no network invoker enabled via feature flags".into(),
        ))
    }
}
