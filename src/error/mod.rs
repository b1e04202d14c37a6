//! Error types for codeloop.

pub mod unified;

pub use unified::{ErrorCategory, ErrorClass, ErrorCode, ErrorDetails, RecoverySuggestion};

use thiserror::Error;

/// Primary error type for all codeloop operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("A run is already in progress; cancel it before starting another")]
    AlreadyRunning,

    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        details: Option<ErrorDetails>,
    },

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited {
        retry_after_ms: Option<u64>,
        message: Option<String>,
    },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Response stream ended before completion")]
    IncompleteResponse,

    #[error("Cancelled")]
    Cancelled,

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Run stopped after {0} model turns without a final answer")]
    TurnLimitExceeded(u32),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl AgentError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
            source: None,
            details: None,
        }
    }

    /// Create an API error with full details.
    pub fn api_with_details(status: u16, message: impl Into<String>, details: ErrorDetails) -> Self {
        Self::Api {
            status,
            message: message.into(),
            source: None,
            details: Some(details),
        }
    }

    /// Create a rate-limit error with an optional server-provided delay.
    pub fn rate_limited(retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            retry_after_ms,
            message: None,
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidState(_) | Self::AlreadyRunning => ErrorCategory::InvalidState,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) | Self::Transport(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::ContextLengthExceeded(_) => ErrorCategory::ContextLength,
            Self::InvalidRequest(_) => ErrorCategory::Api,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::Configuration(_) | Self::TomlParse(_) | Self::TurnLimitExceeded(_) => {
                ErrorCategory::Configuration
            }
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::ToolExecution { .. } | Self::InvalidArgument(_) => ErrorCategory::ToolExecution,
            Self::Api {
                status,
                message,
                details,
                ..
            } => {
                let context_code = details
                    .as_ref()
                    .and_then(|d| d.code)
                    .is_some_and(|code| code == ErrorCode::ContextLengthExceeded);
                match status {
                    401 | 403 => ErrorCategory::Authentication,
                    429 => ErrorCategory::RateLimit,
                    504 => ErrorCategory::Timeout,
                    500..=599 => ErrorCategory::Server,
                    _ if context_code || mentions_context_overflow(message) => {
                        ErrorCategory::ContextLength
                    }
                    _ => ErrorCategory::Api,
                }
            }
            Self::Stream(_) | Self::IncompleteResponse | Self::Io(_) => ErrorCategory::Unknown,
        }
    }

    /// How the retry controller should treat this error.
    pub fn class(&self) -> ErrorClass {
        if let Self::RetriesExhausted { .. } = self {
            return ErrorClass::Fatal;
        }
        match self.category() {
            ErrorCategory::RateLimit
            | ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Server => ErrorClass::Retryable,
            ErrorCategory::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(*ms),
            Self::RateLimited {
                retry_after_ms: None,
                message: Some(message),
            } => parse_retry_hint_ms(message),
            Self::Api {
                status: 429,
                message,
                ..
            } => parse_retry_hint_ms(message),
            _ => None,
        }
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::RateLimit => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Network => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Server => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::ContextLength => RecoverySuggestion::ReduceInputSize,
            ErrorCategory::InvalidState => RecoverySuggestion::CancelActiveRun,
            ErrorCategory::Cancelled => RecoverySuggestion::None,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            _ => RecoverySuggestion::ContactSupport,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    /// Builder and body-decode failures are not transient; only connection-level
    /// failures stay retryable.
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else if err.is_decode() {
            Self::Stream(err.to_string())
        } else {
            Self::Network(err)
        }
    }
}

fn mentions_context_overflow(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("max_tokens")
        || lower.contains("max_output_tokens")
}

/// Extract a "try again in 1.5s" / "try again in 300ms" hint from a rate-limit message.
pub fn parse_retry_hint_ms(message: &str) -> Option<u64> {
    static HINT: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = HINT.get_or_init(|| {
        regex::Regex::new(r"(?i)try again in\s+([0-9]+(?:\.[0-9]+)?)\s*(ms|s)\b")
            .expect("static regex is valid")
    });
    let caps = re.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let ms = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "ms" => value,
        _ => value * 1000.0,
    };
    Some(ms.round() as u64)
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_hint_parses_seconds_and_millis() {
        assert_eq!(
            parse_retry_hint_ms("Rate limit reached. Please try again in 1.5s."),
            Some(1500)
        );
        assert_eq!(parse_retry_hint_ms("try again in 250ms"), Some(250));
        assert_eq!(parse_retry_hint_ms("slow down"), None);
    }

    #[test]
    fn request_timeout_status_is_fatal_but_gateway_timeout_retries() {
        assert_eq!(AgentError::api(408, "request timeout").class(), ErrorClass::Fatal);
        assert_eq!(
            AgentError::api(504, "gateway timeout").category(),
            ErrorCategory::Timeout
        );
        assert!(AgentError::api(504, "gateway timeout").is_retryable());
    }

    #[test]
    fn reqwest_builder_errors_are_not_retried() {
        let err: AgentError = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err()
            .into();
        assert!(matches!(err, AgentError::InvalidRequest(_)), "{err:?}");
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn bad_request_mentioning_max_tokens_is_context_length() {
        let err = AgentError::api(400, "max_tokens is too large for this model");
        assert_eq!(err.category(), ErrorCategory::ContextLength);
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn exhausted_retries_are_fatal_but_keep_source_category() {
        let err = AgentError::RetriesExhausted {
            attempts: 3,
            source: Box::new(AgentError::api(503, "unavailable")),
        };
        assert_eq!(err.category(), ErrorCategory::Server);
        assert_eq!(err.class(), ErrorClass::Fatal);
    }
}
