// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use klaude_protocol::ToolResultUIExtra;
use klaude_session::FileTracker;

use crate::context::ToolContext;
use crate::tool::{ConcurrencyPolicy, Tool, ToolOutput};

/// Exact string replacement in a previously-read file.
///
/// The file must have been read this session, and its on-disk hash must
/// still match the tracker record — an edit over an external modification
/// would silently destroy the other writer's change.
#[derive(Default)]
pub struct EditTool;

#[derive(Deserialize)]
struct EditArgs {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "Edit"
    }

    fn description(&self) -> &str {
        "Perform an exact string replacement in a file. The file must have \
         been read first. old_string must match exactly and, unless \
         replace_all is set, must be unique in the file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "old_string": { "type": "string" },
                "new_string": { "type": "string" },
                "replace_all": { "type": "boolean", "default": false }
            },
            "required": ["file_path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Exclusive
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: EditArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        if args.old_string == args.new_string {
            return ToolOutput::err("old_string and new_string are identical");
        }
        let path = ctx.resolve_path(&args.file_path);

        let Some(record) = ctx.file_tracker.get(&path) else {
            return ToolOutput::err(format!(
                "{} has not been read in this session; read it first",
                path.display()
            ));
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(format!("Cannot read {}: {e}", path.display())),
        };
        if FileTracker::sha256_hex(&bytes) != record.sha256 {
            return ToolOutput::err(format!(
                "{} changed on disk since it was last read; read it again first",
                path.display()
            ));
        }

        let text = String::from_utf8_lossy(&bytes).to_string();
        let occurrences = text.matches(&args.old_string).count();
        if occurrences == 0 {
            return ToolOutput::err("old_string not found in file");
        }
        if occurrences > 1 && !args.replace_all {
            return ToolOutput::err(format!(
                "old_string matches {occurrences} times; make it unique or set replace_all"
            ));
        }

        let new_text = if args.replace_all {
            text.replace(&args.old_string, &args.new_string)
        } else {
            text.replacen(&args.old_string, &args.new_string, 1)
        };
        if let Err(e) = tokio::fs::write(&path, new_text.as_bytes()).await {
            return ToolOutput::err(format!("Cannot write {}: {e}", path.display()));
        }
        ctx.file_tracker.record(&path, new_text.as_bytes(), false);

        let replaced = if args.replace_all { occurrences } else { 1 };
        let diff = unified_snippet(&args.old_string, &args.new_string);
        ToolOutput::ok(format!(
            "Replaced {replaced} occurrence(s) in {}",
            path.display()
        ))
        .with_ui_extra(ToolResultUIExtra::Diff {
            path: path.display().to_string(),
            diff,
        })
    }
}

fn unified_snippet(old: &str, new: &str) -> String {
    let mut out = String::new();
    for line in old.lines() {
        out.push_str(&format!("-{line}\n"));
    }
    for line in new.lines() {
        out.push_str(&format!("+{line}\n"));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::ToolStatus;

    async fn edit(ctx: &ToolContext, args: Value) -> ToolOutput {
        EditTool.call(&args.to_string(), ctx).await
    }

    fn setup(content: &str) -> (tempfile::TempDir, ToolContext, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, content).unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        ctx.file_tracker.record(&path, content.as_bytes(), false);
        (dir, ctx, path)
    }

    #[tokio::test]
    async fn replaces_unique_string() {
        let (_dir, ctx, path) = setup("hello world\n");
        let out = edit(
            &ctx,
            json!({ "file_path": "f.txt", "old_string": "world", "new_string": "rust" }),
        )
        .await;
        assert_eq!(out.status, ToolStatus::Success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello rust\n");
        assert!(matches!(out.ui_extra, Some(ToolResultUIExtra::Diff { .. })));
    }

    #[tokio::test]
    async fn unread_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        let out = edit(
            &ctx,
            json!({ "file_path": "f.txt", "old_string": "x", "new_string": "y" }),
        )
        .await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.contains("read it first"));
    }

    #[tokio::test]
    async fn external_change_is_refused() {
        let (_dir, ctx, path) = setup("original\n");
        std::fs::write(&path, "externally changed\n").unwrap();
        let out = edit(
            &ctx,
            json!({ "file_path": "f.txt", "old_string": "original", "new_string": "new" }),
        )
        .await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.contains("changed on disk"));
    }

    #[tokio::test]
    async fn ambiguous_match_requires_replace_all() {
        let (_dir, ctx, path) = setup("a a a\n");
        let out = edit(
            &ctx,
            json!({ "file_path": "f.txt", "old_string": "a", "new_string": "b" }),
        )
        .await;
        assert_eq!(out.status, ToolStatus::Error);

        let out = edit(
            &ctx,
            json!({ "file_path": "f.txt", "old_string": "a", "new_string": "b", "replace_all": true }),
        )
        .await;
        assert_eq!(out.status, ToolStatus::Success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b b b\n");
    }

    #[tokio::test]
    async fn missing_old_string_is_error() {
        let (_dir, ctx, _) = setup("content\n");
        let out = edit(
            &ctx,
            json!({ "file_path": "f.txt", "old_string": "absent", "new_string": "x" }),
        )
        .await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.contains("not found"));
    }
}
