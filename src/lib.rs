//! codeloop: a single-agent loop for conversational model-completion APIs.
//!
//! An [`AgentLoop`](agent_loop::AgentLoop) sends a conversation to a remote
//! model through a [`CompletionInvoker`](provider::CompletionInvoker), streams
//! the response items back, gates every function call behind an approval
//! decision, feeds tool results into the next turn, and repeats until the
//! model answers. Runs can be cancelled at any suspension point; transient
//! failures are retried with jittered exponential backoff.
//!
//! # Quick Start
//!
//! ```no_run
//! use codeloop::prelude::*;
//!
//! # async fn example() -> codeloop::error::Result<()> {
//! let invoker = codeloop::provider::create_invoker(&ProviderConfig::from_env())?;
//! let agent = AgentLoop::builder(invoker)
//!     .config(LoopConfig::from_env()?)
//!     .callbacks(LoopCallbacks::new().on_item(|item| println!("{item:?}")))
//!     .build()?;
//! let result = agent.run(RunRequest::user("hello")).await?;
//! assert!(result.is_completed());
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
