//! Consumes one turn's response stream.
//!
//! Items are handed to a [`TurnSink`] in arrival order. The turn is committed
//! only when the stream's completion marker arrives; a stream that ends
//! without one is an incomplete turn and commits nothing.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::types::{ResponseItem, ResponseStream, StreamEvent, Usage};

/// Where a turn's items go.
pub(crate) trait TurnSink: Sync {
    /// Deliver one item. Returns `false` once the run has been cancelled.
    fn deliver(&self, item: &ResponseItem) -> bool;

    /// Commit the finished turn. Returns `false` once the run has been
    /// cancelled, in which case nothing was committed.
    fn commit(&self, response_id: &str, items: &[ResponseItem]) -> bool;
}

/// A turn whose stream completed and was committed.
#[derive(Debug, Clone)]
pub(crate) struct ProcessedTurn {
    pub response_id: String,
    pub items: Vec<ResponseItem>,
    pub usage: Option<Usage>,
}

impl ProcessedTurn {
    /// Function calls in the order the model sent them.
    pub fn function_calls(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.items.iter().filter_map(|item| match item {
            ResponseItem::FunctionCall {
                name,
                arguments,
                call_id,
            } => Some((call_id.as_str(), name.as_str(), arguments.as_str())),
            _ => None,
        })
    }
}

/// Drive `stream` to completion.
///
/// Cancellation is checked before every event; `idle_timeout` bounds the gap
/// between events (zero disables it). Errors are not retried here.
pub(crate) async fn process_stream(
    mut stream: ResponseStream,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    sink: &dyn TurnSink,
) -> Result<ProcessedTurn, AgentError> {
    let mut items: Vec<ResponseItem> = Vec::new();
    let mut created_id: Option<String> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            next = next_event(&mut stream, idle_timeout) => next?,
        };
        let Some(event) = next else {
            break;
        };

        match event? {
            StreamEvent::Created { response_id } => {
                tracing::trace!(%response_id, "response created");
                created_id = Some(response_id);
            }
            StreamEvent::Item { item } => {
                if !sink.deliver(&item) {
                    return Err(AgentError::Cancelled);
                }
                items.push(item);
            }
            StreamEvent::Completed { response_id, usage } => {
                if items.is_empty() {
                    tracing::debug!(%response_id, "model returned an empty response");
                }
                if !sink.commit(&response_id, &items) {
                    return Err(AgentError::Cancelled);
                }
                return Ok(ProcessedTurn {
                    response_id,
                    items,
                    usage,
                });
            }
        }
    }

    if items.is_empty() {
        tracing::warn!(response_id = ?created_id, "stream closed before any item arrived");
    } else {
        tracing::warn!(
            response_id = ?created_id,
            items = items.len(),
            "stream closed without a completion marker"
        );
    }
    Err(AgentError::IncompleteResponse)
}

async fn next_event(
    stream: &mut ResponseStream,
    idle_timeout: Duration,
) -> Result<Option<Result<StreamEvent, AgentError>>, AgentError> {
    if idle_timeout.is_zero() {
        return Ok(stream.next().await);
    }
    tokio::time::timeout(idle_timeout, stream.next())
        .await
        .map_err(|_| AgentError::Timeout(idle_timeout.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<ResponseItem>>,
        committed: Mutex<Option<String>>,
        cancel_after: Option<usize>,
    }

    impl TurnSink for RecordingSink {
        fn deliver(&self, item: &ResponseItem) -> bool {
            let mut delivered = self.delivered.lock().unwrap();
            if self.cancel_after.is_some_and(|n| delivered.len() >= n) {
                return false;
            }
            delivered.push(item.clone());
            true
        }

        fn commit(&self, response_id: &str, _items: &[ResponseItem]) -> bool {
            *self.committed.lock().unwrap() = Some(response_id.to_string());
            true
        }
    }

    fn stream_of(events: Vec<Result<StreamEvent, AgentError>>) -> ResponseStream {
        futures::stream::iter(events).boxed()
    }

    #[tokio::test]
    async fn delivers_in_order_and_commits_on_completion() {
        let sink = RecordingSink::default();
        let stream = stream_of(vec![
            Ok(StreamEvent::Created {
                response_id: "resp_1".into(),
            }),
            Ok(StreamEvent::item(ResponseItem::assistant("a"))),
            Ok(StreamEvent::item(ResponseItem::function_call("c1", "shell", "{}"))),
            Ok(StreamEvent::completed("resp_1")),
        ]);

        let turn = process_stream(stream, &CancellationToken::new(), Duration::ZERO, &sink)
            .await
            .unwrap();

        assert_eq!(turn.response_id, "resp_1");
        assert_eq!(turn.function_calls().count(), 1);
        assert_eq!(sink.delivered.lock().unwrap().len(), 2);
        assert_eq!(sink.committed.lock().unwrap().as_deref(), Some("resp_1"));
    }

    #[tokio::test]
    async fn missing_completion_marker_is_incomplete() {
        let sink = RecordingSink::default();
        let stream = stream_of(vec![Ok(StreamEvent::item(ResponseItem::assistant("a")))]);

        let err = process_stream(stream, &CancellationToken::new(), Duration::ZERO, &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::IncompleteResponse));
        assert!(sink.committed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn refused_delivery_stops_the_turn() {
        let sink = RecordingSink {
            cancel_after: Some(1),
            ..RecordingSink::default()
        };
        let stream = stream_of(vec![
            Ok(StreamEvent::item(ResponseItem::assistant("a"))),
            Ok(StreamEvent::item(ResponseItem::assistant("b"))),
            Ok(StreamEvent::completed("resp_1")),
        ]);

        let err = process_stream(stream, &CancellationToken::new(), Duration::ZERO, &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled));
        assert!(sink.committed.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out() {
        let sink = RecordingSink::default();
        let stream: ResponseStream = futures::stream::pending().boxed();

        let err = process_stream(
            stream,
            &CancellationToken::new(),
            Duration::from_secs(5),
            &sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AgentError::Timeout(5000)));
    }
}
