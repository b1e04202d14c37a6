//! Conversation state: the last committed response id, the committed
//! transcript, and function calls from the last committed turn that still
//! need an answer.

use crate::types::ResponseItem;

#[derive(Debug, Clone, PartialEq)]
struct OpenCall {
    call_id: String,
    output: Option<ResponseItem>,
}

/// Per-loop conversation tracker.
///
/// The response id only moves on [`commit`](Self::commit), i.e. after a turn's
/// stream was fully processed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    last_response_id: Option<String>,
    history: Vec<ResponseItem>,
    open_calls: Vec<OpenCall>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_response_id(&self) -> Option<&str> {
        self.last_response_id.as_deref()
    }

    /// Committed transcript, in order.
    pub fn history(&self) -> &[ResponseItem] {
        &self.history
    }

    /// Calls from the last committed turn without an answer yet.
    pub fn unanswered_calls(&self) -> Vec<&str> {
        self.open_calls
            .iter()
            .filter(|c| c.output.is_none())
            .map(|c| c.call_id.as_str())
            .collect()
    }

    /// Whether the last committed turn still has calls to answer (answered
    /// or not) that have not been sent back to the model.
    pub fn has_pending_calls(&self) -> bool {
        !self.open_calls.is_empty()
    }

    pub fn pending_call_count(&self) -> usize {
        self.open_calls.len()
    }

    /// Input that must lead the next turn: one output per open call, in call
    /// order. Calls never answered get an "aborted" output.
    pub fn pending_input(&self) -> Vec<ResponseItem> {
        self.open_calls
            .iter()
            .map(|call| {
                call.output
                    .clone()
                    .unwrap_or_else(|| ResponseItem::aborted_output(&call.call_id))
            })
            .collect()
    }

    /// Record the output for an open call. Unknown call ids are ignored.
    pub fn record_output(&mut self, output: ResponseItem) {
        let Some(call_id) = output.call_id() else {
            return;
        };
        if let Some(call) = self.open_calls.iter_mut().find(|c| c.call_id == call_id) {
            call.output = Some(output);
        }
    }

    /// Commit a fully processed turn: the input it was sent with and the items
    /// it produced join the history, the response id advances, and the turn's
    /// function calls become the open calls.
    ///
    /// Returns `true` if the response id changed.
    pub fn commit(
        &mut self,
        response_id: &str,
        input: &[ResponseItem],
        items: &[ResponseItem],
    ) -> bool {
        self.history.extend_from_slice(input);
        self.history.extend_from_slice(items);
        self.open_calls = items
            .iter()
            .filter(|item| item.is_function_call())
            .filter_map(|item| item.call_id())
            .map(|call_id| OpenCall {
                call_id: call_id.to_string(),
                output: None,
            })
            .collect();
        self.set_response_id(Some(response_id.to_string()))
    }

    /// Replace the tracked id with one supplied by the caller. Open calls
    /// belong to the old id and are dropped when it changes.
    pub fn adopt_response_id(&mut self, response_id: String) -> bool {
        let changed = self.set_response_id(Some(response_id));
        if changed {
            self.open_calls.clear();
        }
        changed
    }

    /// Forget the response id unless open calls still depend on it.
    ///
    /// Returns `true` if the id was cleared.
    pub fn clear_stale_response_id(&mut self) -> bool {
        if self.has_pending_calls() {
            return false;
        }
        self.set_response_id(None)
    }

    /// Start a fresh conversation. Returns `true` if the id changed.
    pub fn reset(&mut self) -> bool {
        self.history.clear();
        self.open_calls.clear();
        self.set_response_id(None)
    }

    fn set_response_id(&mut self, id: Option<String>) -> bool {
        if self.last_response_id == id {
            return false;
        }
        self.last_response_id = id;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ABORTED_MARKER;
    use pretty_assertions::assert_eq;

    fn committed_with_calls() -> ConversationState {
        let mut state = ConversationState::new();
        let items = vec![
            ResponseItem::function_call("call_a", "shell", "{}"),
            ResponseItem::function_call("call_b", "shell", "{}"),
        ];
        assert!(state.commit("resp_1", &[ResponseItem::user("go")], &items));
        state
    }

    #[test]
    fn commit_advances_id_and_opens_calls() {
        let state = committed_with_calls();
        assert_eq!(state.last_response_id(), Some("resp_1"));
        assert_eq!(state.history().len(), 3);
        assert_eq!(state.unanswered_calls(), vec!["call_a", "call_b"]);
    }

    #[test]
    fn pending_input_fills_missing_outputs_with_aborted_marker() {
        let mut state = committed_with_calls();
        state.record_output(ResponseItem::function_output(
            "call_a",
            serde_json::json!({"ok": true}),
        ));

        let input = state.pending_input();
        assert_eq!(input.len(), 2);
        assert_eq!(input[0].call_id(), Some("call_a"));
        assert!(!input[0].has_output_status(ABORTED_MARKER));
        assert_eq!(input[1].call_id(), Some("call_b"));
        assert!(input[1].has_output_status(ABORTED_MARKER));
    }

    #[test]
    fn stale_id_is_kept_while_calls_are_pending() {
        let mut state = committed_with_calls();
        assert!(!state.clear_stale_response_id());
        assert_eq!(state.last_response_id(), Some("resp_1"));

        let answers = state.pending_input();
        assert!(state.commit("resp_2", &answers, &[ResponseItem::assistant("done")]));
        assert!(state.clear_stale_response_id());
        assert_eq!(state.last_response_id(), None);
    }

    #[test]
    fn reset_reports_change_only_once() {
        let mut state = committed_with_calls();
        assert!(state.reset());
        assert!(!state.reset());
        assert!(state.history().is_empty());
    }
}
