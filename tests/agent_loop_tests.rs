//! End-to-end behaviour of the agent loop against a scripted invoker.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

use codeloop::agent_loop::{
    AgentLoop, AgentLoopBuilder, ApprovalDecision, ApprovalPolicy, FnConfirmation, LoopStatus,
    RunRequest, RunStatus,
};
use codeloop::config::{ContextMode, LoopConfig};
use codeloop::error::{AgentError, ErrorCategory};
use codeloop::tools::{AgentTool, AgentToolParameters, Tool, ToolRegistry};
use codeloop::types::{ResponseItem, Role, StreamEvent, DENIED_MARKER};

use common::{wait_until, Recorder, ScriptedInvoker, Step};

fn builder(invoker: &Arc<ScriptedInvoker>, recorder: &Recorder, config: LoopConfig) -> AgentLoopBuilder {
    AgentLoop::builder(invoker.clone())
        .config(config)
        .callbacks(recorder.callbacks())
}

fn auto_approve() -> LoopConfig {
    LoopConfig {
        approval_policy: ApprovalPolicy::AutoApprove,
        ..LoopConfig::default()
    }
}

fn echo_tool(runs: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "echo",
        "Echo the given text",
        AgentToolParameters::object()
            .string("text", "Text to echo", true)
            .build(),
        move |args, _ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                let text = args.get_str("text")?;
                Ok::<_, AgentError>(json!({ "echo": text }))
            }
        },
    ))
}

fn echo_call(call_id: &str, text: &str) -> ResponseItem {
    ResponseItem::function_call(call_id, "echo", json!({ "text": text }).to_string())
}

fn echo_output(call_id: &str, text: &str) -> ResponseItem {
    ResponseItem::function_output(call_id, json!({ "echo": text }))
}

/// Confirmation handler that signals when asked and never answers.
fn stalled_confirmation(asked: Arc<Notify>) -> FnConfirmation {
    FnConfirmation::new(move |_request| {
        let asked = asked.clone();
        async move {
            asked.notify_one();
            futures::future::pending::<ApprovalDecision>().await
        }
    })
}

#[tokio::test]
async fn hello_run_delivers_item_and_tracks_response_id() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![ResponseItem::assistant("Hello!")]);
    invoker.reply("resp_2", vec![ResponseItem::assistant("Still here.")]);
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("hi")).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.turns, 1);
    assert_eq!(result.retries(), 0);
    assert_eq!(recorder.items(), vec![ResponseItem::assistant("Hello!")]);
    assert_eq!(recorder.loading(), vec![true, false]);
    assert_eq!(recorder.ids(), vec![Some("resp_1".to_string())]);
    assert_eq!(agent.status(), LoopStatus::Idle);

    agent.run(RunRequest::user("still there?")).await.unwrap();
    let requests = invoker.requests();
    assert_eq!(requests[0].previous_response_id, None);
    assert_eq!(requests[0].input, vec![ResponseItem::user("hi")]);
    assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_1"));
    assert_eq!(requests[1].input, vec![ResponseItem::user("still there?")]);
    assert_eq!(recorder.loading(), vec![true, false, true, false]);
}

#[tokio::test]
async fn cancel_mid_stream_stops_delivery_and_settles() {
    let invoker = ScriptedInvoker::new();
    let tx = invoker.channel();
    let recorder = Recorder::new();
    let agent = Arc::new(
        builder(&invoker, &recorder, LoopConfig::default())
            .build()
            .unwrap(),
    );

    let run = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(RunRequest::user("write a poem")).await })
    };
    tx.send(Ok(StreamEvent::item(ResponseItem::assistant("Roses"))))
        .await
        .unwrap();
    recorder.wait_for_items(1).await;

    agent.cancel().await;
    assert_eq!(recorder.loading(), vec![true, false]);
    assert_eq!(agent.status(), LoopStatus::Idle);

    let _ = tx
        .send(Ok(StreamEvent::item(ResponseItem::assistant("are red"))))
        .await;
    let result = run.await.unwrap().unwrap();
    assert!(result.is_canceled());
    assert_eq!(result.turns, 0);
    assert_eq!(recorder.items(), vec![ResponseItem::assistant("Roses")]);
    assert_eq!(agent.last_response_id(), None);
    assert!(agent.history().is_empty());
    assert!(!agent.state().abort_requested);
}

#[tokio::test]
async fn cancel_during_approval_keeps_turn_and_aborts_open_call_next_run() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![echo_call("call_1", "x")]);
    invoker.reply("resp_2", vec![ResponseItem::assistant("Okay, skipping it.")]);
    let recorder = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let asked = Arc::new(Notify::new());
    let agent = Arc::new(
        builder(&invoker, &recorder, LoopConfig::default())
            .tools(ToolRegistry::with_tools([echo_tool(runs.clone())]))
            .confirmation(stalled_confirmation(asked.clone()))
            .build()
            .unwrap(),
    );

    let run = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(RunRequest::user("echo x")).await })
    };
    asked.notified().await;
    agent.cancel().await;

    let result = run.await.unwrap().unwrap();
    assert!(result.is_canceled());
    assert_eq!(result.turns, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(agent.last_response_id().as_deref(), Some("resp_1"));
    assert_eq!(agent.state().pending_calls, 1);
    assert_eq!(recorder.ids(), vec![Some("resp_1".to_string())]);

    let result = agent.run(RunRequest::user("never mind")).await.unwrap();
    assert!(result.is_completed());
    let next = &invoker.requests()[1];
    assert_eq!(next.previous_response_id.as_deref(), Some("resp_1"));
    assert_eq!(
        next.input,
        vec![
            ResponseItem::aborted_output("call_1"),
            ResponseItem::user("never mind"),
        ]
    );
    assert_eq!(agent.state().pending_calls, 0);
}

#[tokio::test]
async fn abort_run_decision_cancels_without_running_the_tool() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![echo_call("call_1", "x")]);
    let recorder = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .tools(ToolRegistry::with_tools([echo_tool(runs.clone())]))
        .confirmation(FnConfirmation::new(|_request| async {
            ApprovalDecision::abort_run()
        }))
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("echo x")).await.unwrap();

    assert_eq!(result.status, RunStatus::Canceled);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.items(), vec![echo_call("call_1", "x")]);
    assert_eq!(recorder.loading(), vec![true, false]);
    assert_eq!(agent.state().pending_calls, 1);
    assert_eq!(agent.status(), LoopStatus::Idle);
}

#[tokio::test]
async fn approved_calls_keep_call_ids_and_order() {
    let invoker = ScriptedInvoker::new();
    invoker.reply(
        "resp_1",
        vec![echo_call("call_a", "one"), echo_call("call_b", "two")],
    );
    invoker.reply("resp_2", vec![ResponseItem::assistant("done")]);
    let recorder = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let agent = builder(&invoker, &recorder, auto_approve())
        .tools(ToolRegistry::with_tools([echo_tool(runs.clone())]))
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("echo twice")).await.unwrap();

    assert!(result.is_completed());
    assert_eq!(result.turns, 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        recorder.items(),
        vec![
            echo_call("call_a", "one"),
            echo_call("call_b", "two"),
            echo_output("call_a", "one"),
            echo_output("call_b", "two"),
            ResponseItem::assistant("done"),
        ]
    );
    let second = &invoker.requests()[1];
    assert_eq!(second.previous_response_id.as_deref(), Some("resp_1"));
    assert_eq!(
        second.input,
        vec![echo_output("call_a", "one"), echo_output("call_b", "two")]
    );
    assert_eq!(second.tools.len(), 1);
    assert_eq!(
        recorder.ids(),
        vec![Some("resp_1".to_string()), Some("resp_2".to_string())]
    );
}

#[tokio::test]
async fn denied_call_has_no_side_effect_and_reports_denial() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![echo_call("call_1", "rm -rf")]);
    invoker.reply("resp_2", vec![ResponseItem::assistant("Understood.")]);
    let recorder = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .tools(ToolRegistry::with_tools([echo_tool(runs.clone())]))
        .confirmation(FnConfirmation::new(|_request| async {
            ApprovalDecision::deny("use git instead")
        }))
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("clean up")).await.unwrap();

    assert!(result.is_completed());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let items = recorder.items();
    assert!(items[1].has_output_status(DENIED_MARKER));
    assert_eq!(items[1].call_id(), Some("call_1"));
    assert_eq!(
        invoker.requests()[1].input,
        vec![ResponseItem::denied_output("call_1", Some("use git instead"))]
    );
}

#[tokio::test]
async fn deny_policy_never_consults_the_handler() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![echo_call("call_1", "x")]);
    invoker.reply("resp_2", vec![ResponseItem::assistant("ok")]);
    let recorder = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let asks = Arc::new(AtomicUsize::new(0));
    let config = LoopConfig {
        approval_policy: ApprovalPolicy::Deny,
        ..LoopConfig::default()
    };
    let agent = builder(&invoker, &recorder, config)
        .tools(ToolRegistry::with_tools([echo_tool(runs.clone())]))
        .confirmation({
            let asks = asks.clone();
            FnConfirmation::new(move |_request| {
                asks.fetch_add(1, Ordering::SeqCst);
                async { ApprovalDecision::approve() }
            })
        })
        .build()
        .unwrap();

    agent.run(RunRequest::user("echo x")).await.unwrap();

    assert_eq!(asks.load(Ordering::SeqCst), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(invoker.requests()[1].input[0].has_output_status(DENIED_MARKER));
}

#[tokio::test]
async fn session_approval_is_asked_once_per_tool() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![echo_call("call_1", "a")]);
    invoker.reply("resp_2", vec![echo_call("call_2", "b")]);
    invoker.reply("resp_3", vec![ResponseItem::assistant("both done")]);
    let recorder = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let asks = Arc::new(AtomicUsize::new(0));
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .tools(ToolRegistry::with_tools([echo_tool(runs.clone())]))
        .confirmation({
            let asks = asks.clone();
            FnConfirmation::new(move |_request| {
                asks.fetch_add(1, Ordering::SeqCst);
                async { ApprovalDecision::approve_for_session() }
            })
        })
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("echo a then b")).await.unwrap();

    assert_eq!(result.turns, 3);
    assert_eq!(asks.load(Ordering::SeqCst), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tool_failures_become_call_outputs() {
    let invoker = ScriptedInvoker::new();
    invoker.reply(
        "resp_1",
        vec![
            ResponseItem::function_call("call_1", "flaky", "{}"),
            ResponseItem::function_call("call_2", "missing", "{}"),
        ],
    );
    invoker.reply("resp_2", vec![ResponseItem::assistant("Both failed.")]);
    let recorder = Recorder::new();
    let flaky: Arc<dyn Tool> = Arc::new(AgentTool::new(
        "flaky",
        "Always fails",
        AgentToolParameters::empty(),
        |_args, _ctx| async {
            Err::<serde_json::Value, _>(AgentError::ToolExecution {
                tool_name: "flaky".into(),
                message: "disk on fire".into(),
            })
        },
    ));
    let agent = builder(&invoker, &recorder, auto_approve())
        .tools(ToolRegistry::with_tools([flaky]))
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("try both")).await.unwrap();

    assert!(result.is_completed());
    let input = &invoker.requests()[1].input;
    assert_eq!(input.len(), 2);
    match (&input[0], &input[1]) {
        (
            ResponseItem::FunctionCallOutput { call_id: first, output: flaky_output },
            ResponseItem::FunctionCallOutput { call_id: second, output: missing_output },
        ) => {
            assert_eq!(first, "call_1");
            assert!(flaky_output.contains("disk on fire"));
            assert_eq!(second, "call_2");
            assert!(missing_output.contains("not found"));
        }
        other => panic!("expected two outputs, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_while_idle_forgets_response_id() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![ResponseItem::assistant("Hello!")]);
    invoker.reply("resp_2", vec![ResponseItem::assistant("Fresh start.")]);
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    agent.run(RunRequest::user("hi")).await.unwrap();
    agent.cancel().await;

    assert_eq!(agent.last_response_id(), None);
    assert_eq!(recorder.ids(), vec![Some("resp_1".to_string()), None]);

    agent.run(RunRequest::user("hi again")).await.unwrap();
    assert_eq!(invoker.requests()[1].previous_response_id, None);
}

#[tokio::test]
async fn second_run_while_busy_is_rejected() {
    let invoker = ScriptedInvoker::new();
    let _tx = invoker.channel();
    let recorder = Recorder::new();
    let agent = Arc::new(
        builder(&invoker, &recorder, LoopConfig::default())
            .build()
            .unwrap(),
    );

    let run = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(RunRequest::user("first")).await })
    };
    wait_until(|| agent.status() == LoopStatus::Running).await;

    let second = agent.run(RunRequest::user("second")).await;
    assert!(matches!(second, Err(AgentError::AlreadyRunning)));
    assert!(agent.current_run().is_some());
    assert_eq!(recorder.loading(), vec![true]);

    agent.cancel().await;
    assert!(run.await.unwrap().unwrap().is_canceled());
    assert_eq!(invoker.calls(), 1);
}

#[tokio::test]
async fn terminate_is_idempotent_and_final() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![ResponseItem::assistant("Hello!")]);
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    agent.run(RunRequest::user("hi")).await.unwrap();
    agent.terminate().await;
    agent.terminate().await;
    agent.cancel().await;

    assert_eq!(agent.status(), LoopStatus::Terminated);
    assert_eq!(agent.last_response_id(), None);
    assert_eq!(recorder.ids(), vec![Some("resp_1".to_string()), None]);
    assert!(matches!(
        agent.run(RunRequest::user("again")).await,
        Err(AgentError::InvalidState(_))
    ));
    assert!(matches!(agent.reset(), Err(AgentError::InvalidState(_))));
    assert_eq!(invoker.calls(), 1);
}

#[tokio::test]
async fn terminate_during_run_cancels_it_first() {
    let invoker = ScriptedInvoker::new();
    let _tx = invoker.channel();
    let recorder = Recorder::new();
    let agent = Arc::new(
        builder(&invoker, &recorder, LoopConfig::default())
            .build()
            .unwrap(),
    );

    let run = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(RunRequest::user("long task")).await })
    };
    wait_until(|| invoker.calls() == 1).await;

    agent.terminate().await;

    assert_eq!(agent.status(), LoopStatus::Terminated);
    assert_eq!(recorder.loading(), vec![true, false]);
    assert!(run.await.unwrap().unwrap().is_canceled());
}

#[tokio::test]
async fn full_transcript_mode_resends_history_without_id() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![ResponseItem::assistant("Hello!")]);
    invoker.reply("resp_2", vec![ResponseItem::assistant("Still here.")]);
    let recorder = Recorder::new();
    let config = LoopConfig {
        context_mode: ContextMode::FullTranscript,
        ..LoopConfig::default()
    };
    let agent = builder(&invoker, &recorder, config).build().unwrap();

    agent.run(RunRequest::user("hi")).await.unwrap();
    agent.run(RunRequest::user("again")).await.unwrap();

    let second = &invoker.requests()[1];
    assert_eq!(second.previous_response_id, None);
    assert_eq!(
        second.input,
        vec![
            ResponseItem::user("hi"),
            ResponseItem::assistant("Hello!"),
            ResponseItem::user("again"),
        ]
    );
    assert_eq!(agent.history().len(), 4);
}

#[tokio::test]
async fn turn_limit_fails_the_run_with_a_notice() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![echo_call("call_1", "a")]);
    invoker.reply("resp_2", vec![echo_call("call_2", "b")]);
    let recorder = Recorder::new();
    let config = LoopConfig {
        max_turns: 2,
        ..auto_approve()
    };
    let agent = builder(&invoker, &recorder, config)
        .tools(ToolRegistry::with_tools([echo_tool(Arc::default())]))
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("loop forever")).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.turns, 2);
    assert_eq!(result.error_category, Some(ErrorCategory::Configuration));
    assert_eq!(invoker.calls(), 2);
    let last = recorder.items().pop().unwrap();
    assert!(matches!(last, ResponseItem::Message { role: Role::System, .. }));
}

#[tokio::test]
async fn fatal_error_reports_failure_and_settles() {
    let invoker = ScriptedInvoker::new();
    invoker.fail(AgentError::api(400, "unsupported parameter"));
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("hi")).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_category, Some(ErrorCategory::Api));
    assert!(result.error.unwrap().contains("unsupported parameter"));
    let items = recorder.items();
    assert_eq!(items.len(), 1);
    assert!(items[0].text().unwrap().contains("unsupported parameter"));
    assert_eq!(recorder.loading(), vec![true, false]);
    assert_eq!(agent.status(), LoopStatus::Idle);
}

#[tokio::test]
async fn stream_without_completion_commits_nothing() {
    let invoker = ScriptedInvoker::new();
    invoker.push(Step::Events(vec![Ok(StreamEvent::item(
        ResponseItem::assistant("half an ans"),
    ))]));
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    let result = agent.run(RunRequest::user("hi")).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.turns, 0);
    assert_eq!(agent.last_response_id(), None);
    assert!(agent.history().is_empty());
    assert!(recorder.ids().is_empty());
}

#[tokio::test]
async fn request_overrides_model_and_previous_response_id() {
    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_2", vec![ResponseItem::assistant("Resumed.")]);
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    let request = RunRequest::user("continue")
        .with_model("gpt-4.1")
        .with_instructions("Answer in French.")
        .with_previous_response_id("resp_external");
    agent.run(request).await.unwrap();

    let sent = &invoker.requests()[0];
    assert_eq!(sent.model, "gpt-4.1");
    assert_eq!(sent.instructions, "Answer in French.");
    assert_eq!(sent.previous_response_id.as_deref(), Some("resp_external"));
    assert_eq!(
        recorder.ids(),
        vec![
            Some("resp_external".to_string()),
            Some("resp_2".to_string())
        ]
    );
}

#[tokio::test]
async fn project_doc_is_appended_to_instructions() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    std::fs::write(dir.path().join("AGENTS.md"), "Run cargo fmt before committing.").unwrap();

    let invoker = ScriptedInvoker::new();
    invoker.reply("resp_1", vec![ResponseItem::assistant("Noted.")]);
    let recorder = Recorder::new();
    let config = LoopConfig {
        instructions: "Be brief.".into(),
        ..LoopConfig::default()
    };
    let agent = builder(&invoker, &recorder, config)
        .cwd(dir.path())
        .build()
        .unwrap();

    agent.run(RunRequest::user("hi")).await.unwrap();

    let instructions = &invoker.requests()[0].instructions;
    assert!(instructions.starts_with("Be brief."));
    assert!(instructions.contains("Run cargo fmt before committing."));
}

#[tokio::test]
async fn empty_run_request_fails_without_calling_the_model() {
    let invoker = ScriptedInvoker::new();
    let recorder = Recorder::new();
    let agent = builder(&invoker, &recorder, LoopConfig::default())
        .build()
        .unwrap();

    let result = agent.run(RunRequest::new(Vec::new())).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(invoker.calls(), 0);
    assert_eq!(recorder.loading(), vec![true, false]);
}
