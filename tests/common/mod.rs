//! Shared test helpers: a scripted invoker and recording callbacks.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use codeloop::agent_loop::LoopCallbacks;
use codeloop::error::AgentError;
use codeloop::provider::{CompletionInvoker, CompletionRequest};
use codeloop::types::{ResponseItem, ResponseStream, StreamEvent};

pub type EventResult = Result<StreamEvent, AgentError>;

/// What the invoker does for one call.
pub enum Step {
    /// Stream these events, then end.
    Events(Vec<EventResult>),
    /// Fail before any stream is opened.
    Fail(AgentError),
    /// Stream whatever the test sends through the paired sender.
    Channel(mpsc::Receiver<EventResult>),
    /// Never answer; only cancellation or a timeout ends the call.
    Hang,
}

/// An invoker that plays back a queue of steps and records every request.
#[derive(Default)]
pub struct ScriptedInvoker {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Queue a complete response carrying `items`.
    pub fn reply(&self, response_id: &str, items: Vec<ResponseItem>) {
        let mut events: Vec<EventResult> = vec![Ok(StreamEvent::Created {
            response_id: response_id.to_string(),
        })];
        events.extend(items.into_iter().map(|item| Ok(StreamEvent::item(item))));
        events.push(Ok(StreamEvent::completed(response_id)));
        self.push(Step::Events(events));
    }

    pub fn fail(&self, error: AgentError) {
        self.push(Step::Fail(error));
    }

    /// Queue a stream driven by the returned sender.
    pub fn channel(&self) -> mpsc::Sender<EventResult> {
        let (tx, rx) = mpsc::channel(16);
        self.push(Step::Channel(rx));
        tx
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, AgentError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Channel(rx)) => Ok(ReceiverStream::new(rx).boxed()),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(AgentError::Cancelled)
            }
            None => Err(AgentError::InvalidRequest("script exhausted".into())),
        }
    }
}

/// Records everything the loop reports through its callbacks.
#[derive(Clone, Default)]
pub struct Recorder {
    items: Arc<Mutex<Vec<ResponseItem>>>,
    loading: Arc<Mutex<Vec<bool>>>,
    ids: Arc<Mutex<Vec<Option<String>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> LoopCallbacks {
        let items = self.items.clone();
        let loading = self.loading.clone();
        let ids = self.ids.clone();
        LoopCallbacks::new()
            .on_item(move |item| items.lock().unwrap().push(item))
            .on_loading(move |value| loading.lock().unwrap().push(value))
            .on_last_response_id(move |id| ids.lock().unwrap().push(id))
    }

    pub fn items(&self) -> Vec<ResponseItem> {
        self.items.lock().unwrap().clone()
    }

    pub fn loading(&self) -> Vec<bool> {
        self.loading.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<Option<String>> {
        self.ids.lock().unwrap().clone()
    }

    pub async fn wait_for_items(&self, count: usize) {
        wait_until(|| self.items.lock().unwrap().len() >= count).await;
    }
}

/// Yield until `condition` holds. Panics after a generous real-time bound.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::task::yield_now().await;
    }
}
