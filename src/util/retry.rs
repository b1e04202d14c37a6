//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ErrorCategory, ErrorClass};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration.
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Upper bound applied to server-requested delays.
    #[serde(with = "duration_ms")]
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_retry_after: Duration::from_secs(60),
        }
    }
}

/// State of one attempt sequence. Reset at the start of every sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryContext {
    /// Attempts issued so far.
    pub attempt: u32,
    /// Category of the most recent failure.
    pub last_error: Option<ErrorCategory>,
    /// Delay before the next attempt, while one is pending.
    pub next_delay: Option<Duration>,
    /// Every backoff delay slept, in order.
    pub delays: Vec<Duration>,
}

impl RetryContext {
    pub fn retries(&self) -> usize {
        self.delays.len()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered backoff before retry number `retry` (1-based), capped at `max_backoff`.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay to wait after `error` before retry number `retry`.
    ///
    /// A server-provided delay wins over the computed backoff; either way the
    /// result never exceeds its cap.
    pub fn delay_for(&self, retry: u32, error: &AgentError) -> Duration {
        if let Some(ms) = error.retry_after_ms() {
            return Duration::from_millis(ms).min(self.max_retry_after);
        }
        // Jitter: 75%-125% of backoff
        let jitter_factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        let jittered = self.base_backoff(retry).as_secs_f64() * jitter_factor;
        Duration::from_secs_f64(jittered.min(self.max_backoff.as_secs_f64()))
    }

    /// Execute an async operation with retry.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut ctx = RetryContext::default();
        self.execute_cancellable(&CancellationToken::new(), &mut ctx, operation)
            .await
    }

    /// Execute an async operation with retry, observing `cancel` before each
    /// attempt, while each attempt is in flight, and during every backoff wait.
    ///
    /// Returns `AgentError::Cancelled` as soon as the token fires. When the
    /// attempt budget runs out the last retryable error is returned wrapped in
    /// `AgentError::RetriesExhausted`.
    pub async fn execute_cancellable<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        ctx: &mut RetryContext,
        mut operation: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        *ctx = RetryContext::default();
        let max_attempts = self.max_attempts.max(1);

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            ctx.attempt += 1;
            ctx.next_delay = None;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            ctx.last_error = Some(error.category());

            match error.class() {
                ErrorClass::Cancelled => return Err(AgentError::Cancelled),
                ErrorClass::Fatal => return Err(error),
                ErrorClass::Retryable => {}
            }

            if ctx.attempt >= max_attempts {
                tracing::warn!(
                    attempts = ctx.attempt,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(AgentError::RetriesExhausted {
                    attempts: ctx.attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for(ctx.attempt, &error);
            ctx.next_delay = Some(delay);
            tracing::warn!(
                attempt = ctx.attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );

            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            ctx.delays.push(delay);
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
