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

const MAX_RESULTS: usize = 500;

/// File-name pattern matching over the workspace tree.  Patterns support
/// `**` (any path segments), `*` (within a segment) and `?`.  Results are
/// sorted by modification time, newest first.
#[derive(Default)]
pub struct GlobTool;

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "Glob"
    }

    fn description(&self) -> &str {
        "Find files by glob pattern (e.g. `**/*.rs` or `src/*.toml`). \
         Returns matching paths sorted by modification time, newest first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string", "description": "Directory to search (default: workspace root)" }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: GlobArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        let Some(re) = glob_to_regex(&args.pattern) else {
            return ToolOutput::err(format!("Invalid pattern: {}", args.pattern));
        };
        let root = args
            .path
            .as_deref()
            .map(|p| ctx.resolve_path(p))
            .unwrap_or_else(|| ctx.workdir.clone());

        let cancel = ctx.cancel.clone();
        let walk = tokio::task::spawn_blocking(move || {
            let mut found: Vec<(std::time::SystemTime, String)> = Vec::new();
            for entry in WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| !is_hidden(e))
                .flatten()
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .to_string();
                if re.is_match(&rel) {
                    let mtime = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    found.push((mtime, entry.path().display().to_string()));
                }
            }
            found.sort_by(|a, b| b.0.cmp(&a.0));
            found.truncate(MAX_RESULTS);
            found
        });

        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ToolOutput::aborted(),
            result = walk => match result {
                Ok(r) => r,
                Err(e) => return ToolOutput::err(format!("Walk failed: {e}")),
            },
        };

        if found.is_empty() {
            return ToolOutput::ok("No files matched");
        }
        ToolOutput::ok(
            found
                .into_iter()
                .map(|(_, p)| p)
                .collect::<Vec<_>>()
                .join("\n"),
        )
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

/// Translate a glob into an anchored regex over `/`-separated relative
/// paths: `**/` spans directories, `*` stops at separators, `?` is one char.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also matches zero segments
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
