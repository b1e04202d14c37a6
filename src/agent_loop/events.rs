//! Caller-facing callbacks and ordered item delivery.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::types::ResponseItem;

/// Receives each emitted item, in arrival order.
pub type ItemSink = Arc<dyn Fn(ResponseItem) + Send + Sync>;
/// Receives `true` when a run starts and `false` when it ends.
pub type LoadingSink = Arc<dyn Fn(bool) + Send + Sync>;
/// Receives the tracked response id whenever it changes.
pub type ResponseIdSink = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Callbacks used to observe a loop. All are optional.
///
/// Callbacks are invoked inline and must return promptly. They may read loop
/// state but must not block on the loop's own futures.
#[derive(Clone, Default)]
pub struct LoopCallbacks {
    pub on_item: Option<ItemSink>,
    pub on_loading: Option<LoadingSink>,
    pub on_last_response_id: Option<ResponseIdSink>,
}

impl LoopCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_item(mut self, sink: impl Fn(ResponseItem) + Send + Sync + 'static) -> Self {
        self.on_item = Some(Arc::new(sink));
        self
    }

    pub fn on_loading(mut self, sink: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_loading = Some(Arc::new(sink));
        self
    }

    pub fn on_last_response_id(
        mut self,
        sink: impl Fn(Option<String>) + Send + Sync + 'static,
    ) -> Self {
        self.on_last_response_id = Some(Arc::new(sink));
        self
    }

    pub(crate) fn loading(&self, loading: bool) {
        if let Some(sink) = &self.on_loading {
            sink(loading);
        }
    }

    pub(crate) fn last_response_id(&self, id: Option<String>) {
        if let Some(sink) = &self.on_last_response_id {
            sink(id);
        }
    }
}

impl std::fmt::Debug for LoopCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopCallbacks")
            .field("on_item", &self.on_item.is_some())
            .field("on_loading", &self.on_loading.is_some())
            .field("on_last_response_id", &self.on_last_response_id.is_some())
            .finish()
    }
}

/// Serializes item delivery against cancellation.
///
/// Checking the token and delivering an item happen under one lock, and
/// `cancel` fires the token under the same lock, so no item is delivered
/// once cancellation has been requested.
#[derive(Default)]
pub(crate) struct ItemEmitter {
    gate: Mutex<()>,
}

impl ItemEmitter {
    /// Run `f` unless `token` is already cancelled. Returns `None` if it was.
    pub(crate) fn guarded<T>(&self, token: &CancellationToken, f: impl FnOnce() -> T) -> Option<T> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            return None;
        }
        Some(f())
    }

    /// Deliver `item` to the callbacks. Returns `false` if the run was cancelled.
    pub(crate) fn emit(
        &self,
        callbacks: &LoopCallbacks,
        token: &CancellationToken,
        item: &ResponseItem,
    ) -> bool {
        self.guarded(token, || {
            if let Some(sink) = &callbacks.on_item {
                sink(item.clone());
            }
        })
        .is_some()
    }

    /// Hold the delivery lock, e.g. while firing a run's token.
    pub(crate) fn hold(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
