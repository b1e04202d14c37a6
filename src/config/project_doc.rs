//! Project instructions discovered next to the code being worked on.
//!
//! Walks from the working directory up to the repository root (the first
//! ancestor containing `.git`), collecting `AGENTS.md` (or `codex.md`) files.
//! Files closer to the root come first so more specific guidance wins by
//! appearing last.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const PREFERRED_NAMES: [&str; 2] = ["AGENTS.md", "codex.md"];
const SEPARATOR: &str = "\n\n--- project-doc ---\n\n";

/// Project-doc discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDocConfig {
    pub enabled: bool,
    /// Combined size cap in bytes.
    pub max_bytes: usize,
}

impl Default for ProjectDocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 32 * 1024,
        }
    }
}

/// A project-doc file that was found and read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDoc {
    pub path: PathBuf,
    pub content: String,
}

/// Find project docs for `cwd`, ordered root first. Unreadable files are
/// skipped with a warning.
pub fn discover(cwd: &Path) -> Vec<ProjectDoc> {
    let mut docs = Vec::new();
    for dir in search_directories(cwd) {
        let Some(path) = PREFERRED_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
        else {
            continue;
        };
        match fs::read_to_string(&path) {
            Ok(content) => docs.push(ProjectDoc { path, content }),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "unable to read project doc");
            }
        }
    }
    docs
}

/// Load the combined project doc for `cwd`, truncated to `config.max_bytes`.
pub fn load(cwd: &Path, config: &ProjectDocConfig) -> Option<String> {
    if !config.enabled || config.max_bytes == 0 {
        return None;
    }
    let mut combined = String::new();
    for doc in discover(cwd) {
        let content = doc.content.trim();
        if content.is_empty() {
            continue;
        }
        if !combined.is_empty() {
            combined.push_str("\n\n");
        }
        combined.push_str(content);
    }
    if combined.is_empty() {
        return None;
    }
    if combined.len() > config.max_bytes {
        tracing::warn!(
            bytes = combined.len(),
            limit = config.max_bytes,
            "project doc truncated"
        );
        let mut cutoff = config.max_bytes;
        while cutoff > 0 && !combined.is_char_boundary(cutoff) {
            cutoff -= 1;
        }
        combined.truncate(cutoff);
    }
    Some(combined)
}

/// Append the project doc (if any) to base instructions.
pub fn merge_instructions(instructions: &str, project_doc: Option<&str>) -> String {
    match project_doc {
        Some(doc) if instructions.trim().is_empty() => doc.to_string(),
        Some(doc) => format!("{instructions}{SEPARATOR}{doc}"),
        None => instructions.to_string(),
    }
}

/// `cwd` and its ancestors up to the repository root, root first. Without a
/// repository root only `cwd` itself is searched.
fn search_directories(cwd: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for dir in cwd.ancestors() {
        dirs.push(dir.to_path_buf());
        if dir.join(".git").exists() {
            dirs.reverse();
            return dirs;
        }
    }
    vec![cwd.to_path_buf()]
}
