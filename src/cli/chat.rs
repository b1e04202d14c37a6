//! Interactive chat REPL.
//!
//! Ctrl-C cancels the run in flight, `/reset` starts a new conversation and
//! `/exit` (or end of input) terminates the loop.

use std::io::{BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::ChatArgs;
use crate::agent_loop::{
    AgentLoop, ApprovalDecision, ApprovalRequest, ConfirmationHandler, LoopCallbacks, RunRequest,
    RunStatus,
};
use crate::config::{LoopConfig, ProviderConfig};
use crate::error::AgentError;
use crate::provider::create_invoker;
use crate::tools::{builtin, ToolRegistry};
use crate::types::{ResponseItem, Role};

const OUTPUT_PREVIEW_BYTES: usize = 200;

/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Exit,
    Reset,
    Empty,
    Prompt(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Self::Empty,
            "/exit" | "/quit" => Self::Exit,
            "/reset" | "/clear" => Self::Reset,
            text => Self::Prompt(text.to_string()),
        }
    }
}

/// Lines read from stdin by a background task, shared between the REPL and
/// the confirmation prompt.
#[derive(Clone)]
pub struct StdinLines {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl StdinLines {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::task::spawn_blocking(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next line, or `None` at end of input.
    pub async fn next_line(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

/// Asks on the terminal before each tool call.
pub struct TerminalConfirmation {
    lines: StdinLines,
}

impl TerminalConfirmation {
    pub fn new(lines: StdinLines) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl ConfirmationHandler for TerminalConfirmation {
    async fn confirm(&self, request: &ApprovalRequest) -> ApprovalDecision {
        eprint!(
            "\nAllow {} {}? [y]es / [a]lways / [n]o[: reason] / [q]uit run: ",
            request.tool_name, request.arguments
        );
        let _ = std::io::stderr().flush();
        match self.lines.next_line().await {
            Some(answer) => parse_answer(&answer),
            None => ApprovalDecision::abort_run(),
        }
    }
}

/// Map a typed answer to a decision. Anything unrecognised denies.
pub fn parse_answer(answer: &str) -> ApprovalDecision {
    let answer = answer.trim();
    let (head, reason) = match answer.split_once(':') {
        Some((head, reason)) => (head.trim(), Some(reason.trim())),
        None => (answer, None),
    };
    match head.to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::approve(),
        "a" | "always" => ApprovalDecision::approve_for_session(),
        "q" | "quit" => ApprovalDecision::abort_run(),
        _ => ApprovalDecision::deny(
            reason
                .filter(|r| !r.is_empty())
                .unwrap_or("declined by user"),
        ),
    }
}

/// One-line terminal rendering of an item.
pub fn render_item(item: &ResponseItem) -> String {
    match item {
        ResponseItem::Message { role, content } => match role {
            Role::Assistant => content.clone(),
            Role::System | Role::Developer => format!("! {content}"),
            Role::User => format!("> {content}"),
        },
        ResponseItem::FunctionCall {
            name, arguments, ..
        } => format!("$ {name} {arguments}"),
        ResponseItem::FunctionCallOutput { output, .. } => {
            format!("  {}", preview(output, OUTPUT_PREVIEW_BYTES))
        }
        ResponseItem::Reasoning { text } => format!("(thinking) {text}"),
    }
}

fn preview(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn terminal_callbacks() -> LoopCallbacks {
    LoopCallbacks::new()
        .on_item(|item| {
            let line = render_item(&item);
            match item {
                ResponseItem::Message {
                    role: Role::Assistant,
                    ..
                } => println!("{line}"),
                _ => eprintln!("{line}"),
            }
        })
        .on_loading(|loading| tracing::trace!(loading, "loading changed"))
        .on_last_response_id(|id| tracing::debug!(response_id = ?id, "last response id"))
}

fn load_config(args: &ChatArgs) -> Result<LoopConfig, AgentError> {
    let mut config = match &args.config {
        Some(path) => {
            LoopConfig::load_file(path)?.with_env_overrides(|key| std::env::var(key).ok())?
        }
        None => LoopConfig::load()?,
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Run the `chat` command.
pub async fn run_chat(args: ChatArgs) -> Result<(), AgentError> {
    let config = load_config(&args)?;
    let invoker = create_invoker(&ProviderConfig::from_env())?;
    let lines = StdinLines::spawn();

    let agent = Arc::new(
        AgentLoop::builder(invoker)
            .config(config)
            .tools(ToolRegistry::with_tools(builtin::all_tools()))
            .confirmation(TerminalConfirmation::new(lines.clone()))
            .callbacks(terminal_callbacks())
            .cwd(std::env::current_dir()?)
            .build()?,
    );
    tracing::info!(model = %agent.config().model, policy = %agent.config().approval_policy, "chat started");

    if let Some(prompt) = args.prompt {
        run_turn(&agent, prompt).await?;
    }

    loop {
        eprint!("\n> ");
        let _ = std::io::stderr().flush();
        let Some(line) = lines.next_line().await else {
            break;
        };
        match ReplCommand::parse(&line) {
            ReplCommand::Exit => break,
            ReplCommand::Empty => continue,
            ReplCommand::Reset => {
                agent.reset()?;
                eprintln!("conversation cleared");
            }
            ReplCommand::Prompt(text) => run_turn(&agent, text).await?,
        }
    }

    agent.terminate().await;
    Ok(())
}

async fn run_turn(agent: &Arc<AgentLoop>, text: String) -> Result<(), AgentError> {
    let mut task = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(RunRequest::user(text)).await })
    };

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            agent.cancel().await;
            task.await
        }
    };
    let result = joined
        .map_err(|e| AgentError::InvalidState(format!("run task failed: {e}")))??;

    match result.status {
        RunStatus::Canceled => eprintln!("(interrupted)"),
        RunStatus::Failed | RunStatus::Completed => tracing::debug!(
            turns = result.turns,
            thinking_ms = result.thinking_time.as_millis() as u64,
            "turn finished"
        ),
    }
    Ok(())
}
