//! Core run types for the agent loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, ErrorCategory};
use crate::types::ResponseItem;
use crate::util::retry::duration_ms;

/// Unique run identifier.
pub type RunId = Uuid;

/// Lifecycle status of an agent loop.
///
/// `Idle` and `Running` alternate; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    #[default]
    Idle,
    Running,
    Cancelling,
    Terminated,
}

/// Snapshot of a loop's run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub status: LoopStatus,
    pub last_response_id: Option<String>,
    /// Whether the in-flight run has been asked to stop.
    pub abort_requested: bool,
    /// Calls from the last committed turn still waiting to be answered.
    pub pending_calls: usize,
}

/// Input for one `run`.
///
/// `model` and `instructions` fall back to the loop configuration. A
/// `previous_response_id` replaces the tracked id, e.g. to resume a
/// conversation persisted elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    pub input: Vec<ResponseItem>,
}

impl RunRequest {
    pub fn new(input: Vec<ResponseItem>) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// A request carrying one user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(vec![ResponseItem::user(text)])
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_previous_response_id(mut self, id: impl Into<String>) -> Self {
        self.previous_response_id = Some(id.into());
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Canceled,
}

/// Result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Model turns that were committed.
    pub turns: u32,
    /// Time spent waiting on the model, summed over turns.
    #[serde(with = "duration_ms")]
    pub thinking_time: Duration,
    /// Backoff delays slept before retries, in order.
    #[serde(default)]
    pub retry_delays: Vec<Duration>,
    pub finished_at: DateTime<Utc>,
}

/// Counters gathered while a run executes.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunStats {
    pub turns: u32,
    pub thinking_time: Duration,
    pub retry_delays: Vec<Duration>,
}

impl RunResult {
    fn with_status(run_id: RunId, status: RunStatus, stats: RunStats) -> Self {
        Self {
            run_id,
            status,
            error: None,
            error_category: None,
            turns: stats.turns,
            thinking_time: stats.thinking_time,
            retry_delays: stats.retry_delays,
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn completed(run_id: RunId, stats: RunStats) -> Self {
        Self::with_status(run_id, RunStatus::Completed, stats)
    }

    pub(crate) fn canceled(run_id: RunId, stats: RunStats) -> Self {
        Self::with_status(run_id, RunStatus::Canceled, stats)
    }

    pub(crate) fn failed(run_id: RunId, stats: RunStats, error: &AgentError) -> Self {
        Self {
            error: Some(error.to_string()),
            error_category: Some(error.category()),
            ..Self::with_status(run_id, RunStatus::Failed, stats)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_canceled(&self) -> bool {
        self.status == RunStatus::Canceled
    }

    pub fn retries(&self) -> usize {
        self.retry_delays.len()
    }
}
