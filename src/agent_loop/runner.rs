//! The agent loop: turns, approvals, tool execution, and lifecycle.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{project_doc, ContextMode, LoopConfig};
use crate::error::{AgentError, ErrorCategory, ErrorClass};
use crate::provider::{CompletionInvoker, CompletionRequest};
use crate::tools::{ToolExecutionContext, ToolRegistry};
use crate::types::{ResponseItem, ResponseStream};
use crate::util::retry::RetryContext;
use crate::util::timeout::with_timeout;

use super::approvals::{ApprovalGate, ApprovalOutcome, ApprovalRequest, ConfirmationHandler};
use super::conversation::ConversationState;
use super::events::LoopCallbacks;
use super::lifecycle::Lifecycle;
use super::stream_processor::{process_stream, ProcessedTurn, TurnSink};
use super::types::{LoopStatus, RunId, RunRequest, RunResult, RunState, RunStats};

/// Builder for [`AgentLoop`].
pub struct AgentLoopBuilder {
    invoker: Arc<dyn CompletionInvoker>,
    config: LoopConfig,
    tools: ToolRegistry,
    confirmation: Option<Arc<dyn ConfirmationHandler>>,
    callbacks: LoopCallbacks,
    cwd: Option<PathBuf>,
}

impl AgentLoopBuilder {
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn confirmation(mut self, handler: impl ConfirmationHandler + 'static) -> Self {
        self.confirmation = Some(Arc::new(handler));
        self
    }

    pub fn callbacks(mut self, callbacks: LoopCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Working directory for tools and project-doc discovery. Without it no
    /// project doc is loaded.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn build(self) -> Result<AgentLoop, AgentError> {
        self.config.validate()?;
        let project_doc = self
            .cwd
            .as_deref()
            .and_then(|cwd| project_doc::load(cwd, &self.config.project_doc));
        if project_doc.is_some() {
            tracing::debug!("project doc loaded into instructions");
        }
        Ok(AgentLoop {
            gate: ApprovalGate::new(self.config.approval_policy, self.confirmation),
            invoker: self.invoker,
            config: self.config,
            project_doc,
            tools: self.tools,
            callbacks: self.callbacks,
            cwd: self.cwd,
            lifecycle: Lifecycle::new(),
            conversation: Mutex::new(ConversationState::new()),
        })
    }
}

/// A single-agent conversational loop.
///
/// At most one run is in flight at a time. Share it behind an `Arc` to call
/// [`cancel`](Self::cancel) or [`terminate`](Self::terminate) while a run is
/// being awaited elsewhere.
pub struct AgentLoop {
    config: LoopConfig,
    project_doc: Option<String>,
    invoker: Arc<dyn CompletionInvoker>,
    tools: ToolRegistry,
    gate: ApprovalGate,
    callbacks: LoopCallbacks,
    cwd: Option<PathBuf>,
    lifecycle: Lifecycle,
    conversation: Mutex<ConversationState>,
}

impl AgentLoop {
    pub fn builder(invoker: Arc<dyn CompletionInvoker>) -> AgentLoopBuilder {
        AgentLoopBuilder {
            invoker,
            config: LoopConfig::default(),
            tools: ToolRegistry::new(),
            confirmation: None,
            callbacks: LoopCallbacks::default(),
            cwd: None,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn status(&self) -> LoopStatus {
        self.lifecycle.status()
    }

    pub fn state(&self) -> RunState {
        let status = self.lifecycle.status();
        let abort_requested = self.lifecycle.abort_requested();
        let conversation = self.conversation();
        RunState {
            status,
            last_response_id: conversation.last_response_id().map(str::to_string),
            abort_requested,
            pending_calls: conversation.pending_call_count(),
        }
    }

    /// Id of the run in flight, if any.
    pub fn current_run(&self) -> Option<RunId> {
        self.lifecycle.current_run()
    }

    pub fn last_response_id(&self) -> Option<String> {
        self.conversation().last_response_id().map(str::to_string)
    }

    /// Committed transcript.
    pub fn history(&self) -> Vec<ResponseItem> {
        self.conversation().history().to_vec()
    }

    /// Run one user turn to completion.
    ///
    /// Returns `Err` only when the run cannot start: the loop was terminated
    /// (`InvalidState`) or another run is in flight (`AlreadyRunning`). Every
    /// other outcome, including failures, is reported in the [`RunResult`].
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, AgentError> {
        let run_id = Uuid::new_v4();
        let token = self.lifecycle.begin(run_id)?;
        self.callbacks.loading(true);
        let _settle = SettleOnDrop {
            lifecycle: &self.lifecycle,
            callbacks: &self.callbacks,
            run_id,
        };
        tracing::debug!(%run_id, "run started");

        let mut stats = RunStats::default();
        let outcome = self.execute(&request, &token, &mut stats).await;
        let result = match outcome {
            Ok(()) => RunResult::completed(run_id, stats),
            Err(err) if err.class() == ErrorClass::Cancelled => {
                self.clear_stale_response_id();
                RunResult::canceled(run_id, stats)
            }
            Err(err) => {
                self.report_failure(&token, &err);
                RunResult::failed(run_id, stats, &err)
            }
        };
        tracing::info!(
            %run_id,
            status = ?result.status,
            turns = result.turns,
            retries = result.retries(),
            thinking_ms = result.thinking_time.as_millis() as u64,
            "run finished"
        );
        Ok(result)
    }

    /// Abort the in-flight run and wait until it has stopped.
    ///
    /// When idle, forgets the tracked response id so the next run starts a
    /// fresh conversation, unless calls from the last turn still await an
    /// answer. No-op after termination.
    pub async fn cancel(&self) {
        if self.lifecycle.request_cancel() {
            tracing::debug!("cancel requested; waiting for run to stop");
            self.lifecycle.settled().await;
            return;
        }
        let cleared = self
            .lifecycle
            .if_idle(|| self.conversation().clear_stale_response_id())
            .unwrap_or(false);
        if cleared {
            self.callbacks.last_response_id(None);
        }
    }

    /// Permanently stop the loop. Idempotent.
    pub async fn terminate(&self) {
        if self.lifecycle.request_terminate() {
            tracing::debug!("terminate requested; waiting for run to stop");
            self.lifecycle.settled().await;
        }
        let changed = self.conversation().reset();
        if changed {
            self.callbacks.last_response_id(None);
        }
    }

    /// Forget the conversation. Fails while a run is in flight.
    pub fn reset(&self) -> Result<(), AgentError> {
        if self.lifecycle.status() == LoopStatus::Terminated {
            return Err(AgentError::InvalidState(
                "agent loop has been terminated".into(),
            ));
        }
        let changed = self
            .lifecycle
            .if_idle(|| self.conversation().reset())
            .ok_or(AgentError::AlreadyRunning)?;
        if changed {
            self.callbacks.last_response_id(None);
        }
        Ok(())
    }

    fn conversation(&self) -> MutexGuard<'_, ConversationState> {
        self.conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_stale_response_id(&self) {
        let cleared = self.conversation().clear_stale_response_id();
        if cleared {
            tracing::debug!("cleared last response id");
            self.callbacks.last_response_id(None);
        }
    }

    async fn execute(
        &self,
        request: &RunRequest,
        token: &CancellationToken,
        stats: &mut RunStats,
    ) -> Result<(), AgentError> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let base_instructions = request
            .instructions
            .as_deref()
            .unwrap_or(&self.config.instructions);
        let instructions =
            project_doc::merge_instructions(base_instructions, self.project_doc.as_deref());

        if let Some(id) = &request.previous_response_id {
            let changed = self.conversation().adopt_response_id(id.clone());
            if changed {
                self.callbacks.last_response_id(Some(id.clone()));
            }
        }

        let mut input = self.conversation().pending_input();
        if !input.is_empty() {
            tracing::debug!(
                count = input.len(),
                "answering calls left open by an earlier run"
            );
        }
        input.extend(request.input.iter().cloned());
        if input.is_empty() {
            return Err(AgentError::InvalidRequest(
                "run requires at least one input item".into(),
            ));
        }

        for turn in 1..=self.config.max_turns {
            let completion = self.completion_request(model, &instructions, &input);
            let started = Instant::now();
            let processed = match self.open_stream(&completion, token, stats).await {
                Ok(stream) => {
                    let sink = RunSink {
                        agent: self,
                        token,
                        input: &input,
                    };
                    process_stream(stream, token, self.config.stream_idle_timeout, &sink).await
                }
                Err(err) => Err(err),
            };
            let elapsed = started.elapsed();
            stats.thinking_time += elapsed;
            let processed = processed?;
            stats.turns += 1;

            tracing::debug!(
                turn,
                response_id = %processed.response_id,
                items = processed.items.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                output_tokens = processed.usage.map(|u| u.output_tokens),
                "turn committed"
            );

            if processed.function_calls().next().is_none() {
                return Ok(());
            }
            self.handle_calls(&processed, token).await?;
            input = self.conversation().pending_input();
        }

        Err(AgentError::TurnLimitExceeded(self.config.max_turns))
    }

    fn completion_request(
        &self,
        model: &str,
        instructions: &str,
        input: &[ResponseItem],
    ) -> CompletionRequest {
        let conversation = self.conversation();
        let (previous_response_id, input) = match self.config.context_mode {
            ContextMode::PreviousResponseId => (
                conversation.last_response_id().map(str::to_string),
                input.to_vec(),
            ),
            ContextMode::FullTranscript => (
                None,
                conversation
                    .history()
                    .iter()
                    .chain(input)
                    .cloned()
                    .collect(),
            ),
        };
        CompletionRequest {
            model: model.to_string(),
            instructions: instructions.to_string(),
            previous_response_id,
            input,
            tools: self.tools.definitions(),
            settings: self.config.settings.clone(),
        }
    }

    /// Open the turn's stream, retrying transient failures.
    async fn open_stream(
        &self,
        request: &CompletionRequest,
        token: &CancellationToken,
        stats: &mut RunStats,
    ) -> Result<ResponseStream, AgentError> {
        let invoker = &self.invoker;
        let timeout = self.config.request_timeout;
        let mut retry = RetryContext::default();
        let result = self
            .config
            .retry
            .execute_cancellable(token, &mut retry, || {
                with_timeout(timeout, invoker.invoke(request, token.clone()))
            })
            .await;
        stats.retry_delays.extend(retry.delays.iter().copied());
        result
    }

    async fn handle_calls(
        &self,
        turn: &ProcessedTurn,
        token: &CancellationToken,
    ) -> Result<(), AgentError> {
        for (call_id, name, arguments) in turn.function_calls() {
            let request = ApprovalRequest {
                call_id: call_id.to_string(),
                tool_name: name.to_string(),
                arguments: arguments.to_string(),
            };
            let decision = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AgentError::Cancelled),
                decision = self.gate.decide(&request) => decision,
            };

            let output = match decision.outcome {
                ApprovalOutcome::AbortRun => {
                    tracing::info!(%call_id, tool = %name, "run aborted at approval");
                    self.lifecycle.request_cancel();
                    return Err(AgentError::Cancelled);
                }
                ApprovalOutcome::Deny => {
                    tracing::debug!(%call_id, tool = %name, "call denied");
                    ResponseItem::denied_output(call_id, decision.explanation.as_deref())
                }
                ApprovalOutcome::Approve | ApprovalOutcome::ApproveForSession => {
                    self.execute_tool(call_id, name, arguments).await
                }
            };

            self.conversation().record_output(output.clone());
            if !self.lifecycle.emit(&self.callbacks, token, &output) {
                return Err(AgentError::Cancelled);
            }
        }
        Ok(())
    }

    /// Run a tool; failures become the call's output.
    async fn execute_tool(&self, call_id: &str, name: &str, arguments: &str) -> ResponseItem {
        let ctx = ToolExecutionContext {
            call_id: call_id.to_string(),
            cwd: self.cwd.clone(),
        };
        match self.tools.execute(name, arguments, &ctx).await {
            Ok(value) => ResponseItem::function_output(call_id, value),
            Err(err) => {
                tracing::warn!(%call_id, tool = %name, error = %err, "tool call failed");
                ResponseItem::function_output(call_id, serde_json::json!({ "error": err.to_string() }))
            }
        }
    }

    fn report_failure(&self, token: &CancellationToken, err: &AgentError) {
        tracing::warn!(error = %err, category = ?err.category(), "run failed");
        let notice = ResponseItem::system(failure_notice(err));
        self.lifecycle.emit(&self.callbacks, token, &notice);
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("model", &self.config.model)
            .field("invoker", &self.invoker.name())
            .field("tools", &self.tools)
            .field("status", &self.lifecycle.status())
            .finish_non_exhaustive()
    }
}

fn failure_notice(err: &AgentError) -> String {
    match err.category() {
        ErrorCategory::ContextLength => format!(
            "The conversation no longer fits the model's context window ({err}). \
             Start a new conversation or send a shorter message."
        ),
        ErrorCategory::RateLimit => {
            format!("The model is rate limited ({err}). Wait a moment and try again.")
        }
        ErrorCategory::Authentication => {
            format!("The model provider rejected the credentials ({err}).")
        }
        _ => format!("Request failed: {err}"),
    }
}

/// Item sink for one turn of a run.
struct RunSink<'a> {
    agent: &'a AgentLoop,
    token: &'a CancellationToken,
    input: &'a [ResponseItem],
}

impl TurnSink for RunSink<'_> {
    fn deliver(&self, item: &ResponseItem) -> bool {
        self.agent
            .lifecycle
            .emit(&self.agent.callbacks, self.token, item)
    }

    fn commit(&self, response_id: &str, items: &[ResponseItem]) -> bool {
        self.agent
            .lifecycle
            .guarded(self.token, || {
                let changed = self
                    .agent
                    .conversation()
                    .commit(response_id, self.input, items);
                if changed {
                    self.agent
                        .callbacks
                        .last_response_id(Some(response_id.to_string()));
                }
            })
            .is_some()
    }
}

/// Reports loading=false and settles the lifecycle when a run ends, even if
/// the run future is dropped early.
struct SettleOnDrop<'a> {
    lifecycle: &'a Lifecycle,
    callbacks: &'a LoopCallbacks,
    run_id: RunId,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        self.callbacks.loading(false);
        let status = self.lifecycle.finish();
        tracing::debug!(run_id = %self.run_id, ?status, "run settled");
    }
}
