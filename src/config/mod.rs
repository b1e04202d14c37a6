//! Configuration system (layered: defaults < config file < env).

pub mod project_doc;

pub use project_doc::{ProjectDoc, ProjectDocConfig};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::agent_loop::ApprovalPolicy;
use crate::error::AgentError;
use crate::types::GenerationSettings;
use crate::util::retry::{duration_ms, RetryPolicy};

/// Model used when nothing else is configured.
pub const DEFAULT_MODEL: &str = "o4-mini";

/// How conversation context reaches the model on each turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContextMode {
    /// Send only new input and the last response id; the server holds the rest.
    #[default]
    PreviousResponseId,
    /// Resend the whole committed transcript every turn, without an id.
    FullTranscript,
}

/// Settings for one agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub model: String,
    pub instructions: String,
    pub approval_policy: ApprovalPolicy,
    pub retry: RetryPolicy,
    /// Limit for opening one completion stream. Expiry is retryable.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Longest gap allowed between stream events. Expiry fails the turn.
    #[serde(rename = "stream_idle_timeout_ms", with = "duration_ms")]
    pub stream_idle_timeout: Duration,
    /// Upper bound on model turns within one run.
    pub max_turns: u32,
    pub context_mode: ContextMode,
    pub settings: GenerationSettings,
    pub project_doc: ProjectDocConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            instructions: String::new(),
            approval_policy: ApprovalPolicy::default(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(300),
            max_turns: 20,
            context_mode: ContextMode::default(),
            settings: GenerationSettings::default(),
            project_doc: ProjectDocConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Defaults overridden by `CODELOOP_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self, AgentError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CODELOOP_*` overrides read through `lookup`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AgentError> {
        if let Some(model) = lookup("CODELOOP_MODEL").filter(|m| !m.trim().is_empty()) {
            self.model = model;
        }
        if let Some(policy) = lookup("CODELOOP_APPROVAL_POLICY") {
            self.approval_policy = parse_env("CODELOOP_APPROVAL_POLICY", &policy)?;
        }
        if let Some(retries) = lookup("CODELOOP_MAX_RETRIES") {
            let retries: u32 = parse_env("CODELOOP_MAX_RETRIES", &retries)?;
            self.retry.max_attempts = retries.saturating_add(1);
        }
        if let Some(turns) = lookup("CODELOOP_MAX_TURNS") {
            self.max_turns = parse_env("CODELOOP_MAX_TURNS", &turns)?;
        }
        if let Some(ms) = lookup("CODELOOP_REQUEST_TIMEOUT_MS") {
            self.request_timeout =
                Duration::from_millis(parse_env("CODELOOP_REQUEST_TIMEOUT_MS", &ms)?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Parse a TOML config document.
    pub fn from_toml_str(contents: &str) -> Result<Self, AgentError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file. A missing file yields defaults.
    pub fn load_file(path: &Path) -> Result<Self, AgentError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Default file + environment overrides.
    pub fn load() -> Result<Self, AgentError> {
        let _ = dotenvy::dotenv();
        let base = match default_path() {
            Some(path) => Self::load_file(&path)?,
            None => Self::default(),
        };
        base.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.model.trim().is_empty() {
            return Err(AgentError::Configuration("model must not be empty".into()));
        }
        if self.max_turns == 0 {
            return Err(AgentError::Configuration("max_turns must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AgentError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(AgentError::Configuration(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Instructions with the project doc for `cwd` appended.
    pub fn effective_instructions(&self, cwd: &Path) -> String {
        let doc = project_doc::load(cwd, &self.project_doc);
        project_doc::merge_instructions(&self.instructions, doc.as_deref())
    }
}

/// Credentials for the HTTP completion invoker.
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ProviderConfig {
    /// Load from environment variables (`OPENAI_API_KEY`, `OPENAI_BASE_URL`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_empty("OPENAI_API_KEY"),
            base_url: non_empty("OPENAI_BASE_URL"),
        }
    }
}

/// `~/.codeloop/config.toml`, when a home directory is known.
pub fn default_path() -> Option<PathBuf> {
    directories::UserDirs::new().map(|dirs| dirs.home_dir().join(".codeloop").join("config.toml"))
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, AgentError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AgentError::Configuration(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        let config = LoopConfig::default()
            .with_env_overrides(lookup(&[
                ("CODELOOP_MODEL", "gpt-4.1"),
                ("CODELOOP_APPROVAL_POLICY", "auto-approve"),
                ("CODELOOP_MAX_RETRIES", "2"),
                ("CODELOOP_REQUEST_TIMEOUT_MS", "1500"),
            ]))
            .unwrap();
        assert_eq!(config.model, "gpt-4.1");
        assert_eq!(config.approval_policy, ApprovalPolicy::AutoApprove);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_turns, 20);
    }

    #[test]
    fn bad_env_value_is_a_configuration_error() {
        let err = LoopConfig::default()
            .with_env_overrides(lookup(&[("CODELOOP_MAX_TURNS", "many")]))
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(ref m) if m.contains("CODELOOP_MAX_TURNS")));
    }

    #[test]
    fn provider_config_debug_redacts_key() {
        let config = ProviderConfig {
            api_key: Some("sk-secret".into()),
            base_url: None,
        };
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
