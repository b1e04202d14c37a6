//! CLI entry point for codeloop.

pub mod chat;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::agent_loop::ApprovalPolicy;
use crate::config::LoopConfig;
use crate::util::logging::LogFormat;

/// codeloop CLI
#[derive(Parser, Debug)]
#[command(name = "codeloop", version, about = "Interactive coding agent loop")]
pub struct Cli {
    /// Log filter when RUST_LOG is unset (e.g. warn, codeloop=debug)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Log output format (compact, json)
    #[arg(long, global = true, default_value = "compact")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an interactive chat session
    Chat(ChatArgs),
}

/// Arguments for the `chat` subcommand.
#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// Model to use (overrides config and CODELOOP_MODEL)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Approval policy for tool calls (ask, auto-approve, deny)
    #[arg(short, long)]
    pub approval_policy: Option<ApprovalPolicy>,

    /// Extra system instructions
    #[arg(short, long)]
    pub instructions: Option<String>,

    /// Approve every tool call without asking
    #[arg(long, conflicts_with = "approval_policy")]
    pub full_auto: bool,

    /// Temperature (0.0 - 2.0)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Max output tokens per turn
    #[arg(long)]
    pub max_output_tokens: Option<u32>,

    /// Config file (defaults to ~/.codeloop/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Skip AGENTS.md / codex.md discovery
    #[arg(long)]
    pub no_project_doc: bool,

    /// First prompt to send before entering the REPL
    pub prompt: Option<String>,
}

impl ChatArgs {
    /// Apply command-line overrides on top of file and env configuration.
    pub fn apply(&self, config: &mut LoopConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(policy) = self.approval_policy {
            config.approval_policy = policy;
        }
        if self.full_auto {
            config.approval_policy = ApprovalPolicy::AutoApprove;
        }
        if let Some(instructions) = &self.instructions {
            config.instructions = instructions.clone();
        }
        if let Some(t) = self.temperature {
            config.settings.temperature = Some(t);
        }
        if let Some(max) = self.max_output_tokens {
            config.settings.max_output_tokens = Some(max);
        }
        if self.no_project_doc {
            config.project_doc.enabled = false;
        }
    }
}
