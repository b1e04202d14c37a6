//! Loading loop configuration from TOML files and environment overrides.

use std::collections::HashMap;
use std::time::Duration;

use pretty_assertions::assert_eq;

use codeloop::agent_loop::ApprovalPolicy;
use codeloop::config::{ContextMode, LoopConfig, DEFAULT_MODEL};
use codeloop::error::AgentError;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_are_valid() {
    let config = LoopConfig::default();
    assert_eq!(config.model, DEFAULT_MODEL);
    assert_eq!(config.approval_policy, ApprovalPolicy::Ask);
    assert_eq!(config.context_mode, ContextMode::PreviousResponseId);
    assert_eq!(config.max_turns, 20);
    assert!(config.validate().is_ok());
}

#[test]
fn toml_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
model = "gpt-4.1"
instructions = "Prefer small diffs."
approval_policy = "auto-approve"
context_mode = "full_transcript"
max_turns = 8
request_timeout_ms = 45000

[retry]
max_attempts = 3
initial_backoff = 250

[settings]
temperature = 0.2

[project_doc]
enabled = false
"#,
    )
    .unwrap();

    let config = LoopConfig::load_file(&path).unwrap();

    assert_eq!(config.model, "gpt-4.1");
    assert_eq!(config.instructions, "Prefer small diffs.");
    assert_eq!(config.approval_policy, ApprovalPolicy::AutoApprove);
    assert_eq!(config.context_mode, ContextMode::FullTranscript);
    assert_eq!(config.max_turns, 8);
    assert_eq!(config.request_timeout, Duration::from_secs(45));
    assert_eq!(config.stream_idle_timeout, Duration::from_secs(300));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
    assert_eq!(config.retry.max_backoff, Duration::from_secs(30));
    assert_eq!(config.settings.temperature, Some(0.2));
    assert!(!config.project_doc.enabled);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoopConfig::load_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, LoopConfig::default());
}

#[test]
fn malformed_or_invalid_files_are_rejected() {
    assert!(matches!(
        LoopConfig::from_toml_str("model = ["),
        Err(AgentError::TomlParse(_))
    ));
    assert!(matches!(
        LoopConfig::from_toml_str("max_turns = 0"),
        Err(AgentError::Configuration(_))
    ));
    assert!(matches!(
        LoopConfig::from_toml_str("approval_policy = \"sometimes\""),
        Err(AgentError::TomlParse(_))
    ));
}

#[test]
fn environment_overrides_file_values() {
    let base = LoopConfig::from_toml_str("model = \"gpt-4.1\"\nmax_turns = 8").unwrap();

    let config = base
        .with_env_overrides(lookup(&[
            ("CODELOOP_MODEL", "o3"),
            ("CODELOOP_APPROVAL_POLICY", "deny"),
            ("CODELOOP_MAX_RETRIES", "2"),
            ("CODELOOP_REQUEST_TIMEOUT_MS", "5000"),
        ]))
        .unwrap();

    assert_eq!(config.model, "o3");
    assert_eq!(config.approval_policy, ApprovalPolicy::Deny);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.request_timeout, Duration::from_secs(5));
    assert_eq!(config.max_turns, 8);
}

#[test]
fn unparsable_environment_value_is_a_configuration_error() {
    let result =
        LoopConfig::default().with_env_overrides(lookup(&[("CODELOOP_MAX_TURNS", "lots")]));
    assert!(matches!(result, Err(AgentError::Configuration(_))));
}

#[test]
fn effective_instructions_include_project_doc() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("AGENTS.md"), "Tests live in tests/.").unwrap();
    let config = LoopConfig {
        instructions: "Be careful.".into(),
        ..LoopConfig::default()
    };

    let merged = config.effective_instructions(dir.path());
    assert!(merged.starts_with("Be careful."));
    assert!(merged.ends_with("Tests live in tests/."));

    let mut disabled = config.clone();
    disabled.project_doc.enabled = false;
    assert_eq!(disabled.effective_instructions(dir.path()), "Be careful.");
}
