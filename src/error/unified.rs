//! Unified error classification and recovery.

use serde::{Deserialize, Serialize};

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidApiKey,
    InsufficientQuota,
    RateLimitExceeded,
    InvalidRequest,
    ContextLengthExceeded,
    ServerError,
    ServiceUnavailable,
    Timeout,
    NetworkError,
    Unknown,
}

impl ErrorCode {
    /// Map a provider-specific error code string onto a known code.
    pub fn from_provider_code(code: &str) -> Self {
        match code {
            "invalid_api_key" => Self::InvalidApiKey,
            "insufficient_quota" => Self::InsufficientQuota,
            "rate_limit_exceeded" => Self::RateLimitExceeded,
            "invalid_request_error" => Self::InvalidRequest,
            "context_length_exceeded" | "max_tokens_exceeded" => Self::ContextLengthExceeded,
            "server_error" => Self::ServerError,
            "service_unavailable" => Self::ServiceUnavailable,
            _ => Self::Unknown,
        }
    }
}

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Server,
    Api,
    ContextLength,
    InvalidState,
    Cancelled,
    Configuration,
    Serialization,
    ToolExecution,
    Unknown,
}

/// How the retry controller treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry with backoff.
    Retryable,
    /// Surface immediately.
    Fatal,
    /// The abort signal fired; stop without surfacing an error.
    Cancelled,
}

/// Structured details returned by a provider API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: Option<ErrorCode>,
    pub provider_code: Option<String>,
    pub param: Option<String>,
    pub request_id: Option<String>,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    CheckCredentials,
    CheckConfiguration,
    IncreaseTimeout,
    ReduceInputSize,
    CancelActiveRun,
    CheckToolImplementation,
    None,
    ContactSupport,
}
