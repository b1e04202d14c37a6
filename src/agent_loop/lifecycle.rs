//! Run/cancel/terminate state machine for one agent loop.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::events::{ItemEmitter, LoopCallbacks};
use super::types::{LoopStatus, RunId};
use crate::error::AgentError;
use crate::types::ResponseItem;

#[derive(Debug, Default)]
struct Inner {
    status: LoopStatus,
    token: Option<CancellationToken>,
    run_id: Option<RunId>,
    terminate_requested: bool,
}

/// Owns the loop status and the abort signal of the in-flight run.
///
/// Lock order: delivery gate, then this state, then conversation state.
pub(crate) struct Lifecycle {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<LoopStatus>,
    emitter: ItemEmitter,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (status_tx, _) = watch::channel(LoopStatus::Idle);
        Self {
            inner: Mutex::new(Inner::default()),
            status_tx,
            emitter: ItemEmitter::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, inner: &mut Inner, status: LoopStatus) {
        inner.status = status;
        self.status_tx.send_replace(status);
    }

    pub(crate) fn status(&self) -> LoopStatus {
        self.lock().status
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.lock().token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub(crate) fn current_run(&self) -> Option<RunId> {
        self.lock().run_id
    }

    /// Idle -> Running. Hands out the abort signal for the new run.
    pub(crate) fn begin(&self, run_id: RunId) -> Result<CancellationToken, AgentError> {
        let mut inner = self.lock();
        if inner.terminate_requested || inner.status == LoopStatus::Terminated {
            return Err(AgentError::InvalidState(
                "agent loop has been terminated".into(),
            ));
        }
        if matches!(inner.status, LoopStatus::Running | LoopStatus::Cancelling) {
            return Err(AgentError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        inner.token = Some(token.clone());
        inner.run_id = Some(run_id);
        self.set_status(&mut inner, LoopStatus::Running);
        Ok(token)
    }

    /// Running/Cancelling -> Idle, or Terminated if termination was requested.
    pub(crate) fn finish(&self) -> LoopStatus {
        let mut inner = self.lock();
        inner.token = None;
        inner.run_id = None;
        let next = if inner.terminate_requested {
            LoopStatus::Terminated
        } else {
            LoopStatus::Idle
        };
        self.set_status(&mut inner, next);
        next
    }

    /// Fire the abort signal of the in-flight run. Returns `true` if a run
    /// was in flight.
    pub(crate) fn request_cancel(&self) -> bool {
        let _gate = self.emitter.hold();
        let mut inner = self.lock();
        self.abort_in_flight(&mut inner)
    }

    /// Mark the loop terminated, aborting any in-flight run first. Returns
    /// `true` if a run was in flight and the caller should wait for it.
    pub(crate) fn request_terminate(&self) -> bool {
        let _gate = self.emitter.hold();
        let mut inner = self.lock();
        inner.terminate_requested = true;
        if self.abort_in_flight(&mut inner) {
            return true;
        }
        if inner.status != LoopStatus::Terminated {
            self.set_status(&mut inner, LoopStatus::Terminated);
        }
        false
    }

    fn abort_in_flight(&self, inner: &mut Inner) -> bool {
        match inner.status {
            LoopStatus::Running => {
                if let Some(token) = &inner.token {
                    token.cancel();
                }
                self.set_status(inner, LoopStatus::Cancelling);
                true
            }
            LoopStatus::Cancelling => true,
            LoopStatus::Idle | LoopStatus::Terminated => false,
        }
    }

    /// Run `f` while holding the state lock, but only if the loop is idle.
    pub(crate) fn if_idle<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let inner = self.lock();
        (inner.status == LoopStatus::Idle).then(f)
    }

    /// Wait until no run is in flight.
    pub(crate) async fn settled(&self) {
        let mut rx = self.status_tx.subscribe();
        let _ = rx
            .wait_for(|status| matches!(status, LoopStatus::Idle | LoopStatus::Terminated))
            .await;
    }

    /// Deliver an item unless the run has been cancelled.
    pub(crate) fn emit(
        &self,
        callbacks: &LoopCallbacks,
        token: &CancellationToken,
        item: &ResponseItem,
    ) -> bool {
        self.emitter.emit(callbacks, token, item)
    }

    /// Run `f` atomically with respect to cancellation.
    pub(crate) fn guarded<T>(&self, token: &CancellationToken, f: impl FnOnce() -> T) -> Option<T> {
        self.emitter.guarded(token, f)
    }
}
