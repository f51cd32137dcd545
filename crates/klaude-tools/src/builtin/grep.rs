// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolOutput};

const MAX_MATCHES: usize = 200;
const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;

/// Regex content search over the workspace tree.  Hidden directories and
/// binary files are skipped; output is `path:line:text`, leading matches
/// first (the offload policy may truncate the tail).
#[derive(Default)]
pub struct GrepTool;

#[derive(Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    /// Case-insensitive matching.
    #[serde(default)]
    ignore_case: bool,
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "Grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching \
         lines as path:line:text, capped at 200 matches."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression" },
                "path": { "type": "string", "description": "Directory to search (default: workspace root)" },
                "ignore_case": { "type": "boolean", "default": false }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: GrepArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        let pattern = if args.ignore_case {
            format!("(?i){}", args.pattern)
        } else {
            args.pattern.clone()
        };
        let re = match Regex::new(&pattern) {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(format!("Invalid pattern: {e}")),
        };
        let root = args
            .path
            .as_deref()
            .map(|p| ctx.resolve_path(p))
            .unwrap_or_else(|| ctx.workdir.clone());

        // Filesystem walking is blocking; keep it off the event loop.
        let cancel = ctx.cancel.clone();
        let search = tokio::task::spawn_blocking(move || {
            let mut matches: Vec<String> = Vec::new();
            let mut truncated = false;
            'files: for entry in WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| !is_hidden(e))
                .flatten()
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                    continue;
                }
                let Ok(bytes) = std::fs::read(entry.path()) else {
                    continue;
                };
                if bytes[..bytes.len().min(1024)].contains(&0) {
                    continue;
                }
                let text = String::from_utf8_lossy(&bytes);
                for (lineno, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        if matches.len() >= MAX_MATCHES {
                            truncated = true;
                            break 'files;
                        }
                        matches.push(format!(
                            "{}:{}:{}",
                            entry.path().display(),
                            lineno + 1,
                            line.trim_end()
                        ));
                    }
                }
            }
            (matches, truncated)
        });

        let (matches, truncated) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ToolOutput::aborted(),
            result = search => match result {
                Ok(r) => r,
                Err(e) => return ToolOutput::err(format!("Search failed: {e}")),
            },
        };

        if matches.is_empty() {
            return ToolOutput::ok("No matches found");
        }
        let mut text = matches.join("\n");
        if truncated {
            text.push_str(&format!(
                "\n[... match cap of {MAX_MATCHES} reached; use a more specific pattern ...]"
            ));
        }
        ToolOutput::ok(text)
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::ToolStatus;

    fn setup() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "alpha in hidden dir").unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        (dir, ctx)
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .call(&json!({ "pattern": "fn alpha" }).to_string(), &ctx)
            .await;
        assert_eq!(out.status, ToolStatus::Success);
        assert!(out.text.contains("a.rs:1:fn alpha() {}"));
    }

    #[tokio::test]
    async fn hidden_directories_are_skipped() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .call(&json!({ "pattern": "alpha" }).to_string(), &ctx)
            .await;
        assert!(!out.text.contains(".git"));
    }

    #[tokio::test]
    async fn no_matches_is_success() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .call(&json!({ "pattern": "nonexistent_symbol" }).to_string(), &ctx)
            .await;
        assert_eq!(out.status, ToolStatus::Success);
        assert_eq!(out.text, "No matches found");
    }

    #[tokio::test]
    async fn ignore_case_flag_widens_match() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .call(
                &json!({ "pattern": "FN ALPHA", "ignore_case": true }).to_string(),
                &ctx,
            )
            .await;
        assert!(out.text.contains("a.rs:1"));
    }

    #[tokio::test]
    async fn bad_regex_is_invalid_arguments() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .call(&json!({ "pattern": "([unclosed" }).to_string(), &ctx)
            .await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.contains("Invalid pattern"));
    }
}
