//! Built-in tools for the CLI agent.
//!
//! `shell` runs a command through `sh -c`; `read_file` reads a UTF-8 file.
//! Both resolve relative paths against [`ToolExecutionContext::cwd`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AgentError;
use crate::tools::tool::{AgentTool, Tool, ToolExecutionContext};
use crate::tools::types::AgentToolParameters;

const SHELL_OUTPUT_MAX_BYTES: usize = 32_768;
const READ_FILE_MAX_BYTES: usize = 65_536;
const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(30);

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s[..cutoff].to_string()
}

fn resolve(ctx: &ToolExecutionContext, path: &str) -> PathBuf {
    match &ctx.cwd {
        Some(cwd) => cwd.join(path),
        None => PathBuf::from(path),
    }
}

/// All built-in tools.
pub fn all_tools() -> Vec<Arc<dyn Tool>> {
    vec![shell_tool(), read_file_tool()]
}

/// Create the `shell` tool.
///
/// Captures stdout and stderr, applies a timeout (30s unless `timeout_ms` is
/// given), and truncates combined output beyond 32 KB.
pub fn shell_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "shell",
        "Execute a shell command and return its output",
        AgentToolParameters::object()
            .string("command", "The shell command to execute", true)
            .integer("timeout_ms", "Timeout in milliseconds", false)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let command = args.get_str("command")?;
            let timeout = args
                .get_u64_opt("timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SHELL_TIMEOUT);

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command).kill_on_drop(true);
            if let Some(ref cwd) = ctx.cwd {
                cmd.current_dir(cwd);
            }

            let output = match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(AgentError::ToolExecution {
                        tool_name: "shell".into(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(AgentError::ToolExecution {
                        tool_name: "shell".into(),
                        message: format!("command timed out after {}ms", timeout.as_millis()),
                    });
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = format!("{stdout}{stderr}");
            let truncated = combined.len() > SHELL_OUTPUT_MAX_BYTES;
            if truncated {
                combined = truncate_utf8(&combined, SHELL_OUTPUT_MAX_BYTES);
                combined.push_str("\n... (truncated)");
            }

            Ok(serde_json::json!({
                "exit_code": output.status.code(),
                "output": combined,
                "truncated": truncated,
            }))
        },
    ))
}

/// Create the `read_file` tool. Content is capped at 64 KB.
pub fn read_file_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "read_file",
        "Read a file's contents as UTF-8 text",
        AgentToolParameters::object()
            .string("path", "Path to the file to read", true)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let path = args.get_str("path")?;
            let content = tokio::fs::read_to_string(resolve(&ctx, path))
                .await
                .map_err(|e| AgentError::ToolExecution {
                    tool_name: "read_file".into(),
                    message: format!("{path}: {e}"),
                })?;

            let total_bytes = content.len();
            let truncated = total_bytes > READ_FILE_MAX_BYTES;
            let display = if truncated {
                let mut s = truncate_utf8(&content, READ_FILE_MAX_BYTES);
                s.push_str("\n... (truncated)");
                s
            } else {
                content
            };

            Ok(serde_json::json!({
                "content": display,
                "bytes": total_bytes,
                "truncated": truncated,
            }))
        },
    ))
}
