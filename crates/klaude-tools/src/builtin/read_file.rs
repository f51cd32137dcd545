// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tool::{OffloadStrategy, Tool, ToolOutput};

const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

/// Reads a file with an offset/limit line window, numbering lines the way
/// `cat -n` does.  Successful reads record the content hash in the file
/// tracker so external edits surface as reminders on the next turn.
#[derive(Default)]
pub struct ReadTool;

#[derive(Deserialize)]
struct ReadArgs {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "Read"
    }

    fn description(&self) -> &str {
        "Read a file from the filesystem. Returns up to 2000 lines by \
         default, numbered like `cat -n`; use offset/limit for longer files. \
         Binary files are rejected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute or workspace-relative path"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line number to start from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Number of lines to read"
                }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    fn offload(&self) -> OffloadStrategy {
        // Windowing above bounds the output; the offload policy must not
        // truncate it a second time.
        OffloadStrategy::ReadTool
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: ReadArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        let path = ctx.resolve_path(&args.file_path);

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(format!("Cannot read {}: {e}", path.display())),
        };
        if bytes[..bytes.len().min(4096)].contains(&0) {
            return ToolOutput::err(format!("{} is a binary file", path.display()));
        }

        ctx.file_tracker.record(&path, &bytes, false);

        let text = String::from_utf8_lossy(&bytes);
        let offset = args.offset.unwrap_or(1).max(1);
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT);

        let mut numbered = String::new();
        let mut shown = 0usize;
        let mut total = 0usize;
        for (i, line) in text.lines().enumerate() {
            total = i + 1;
            if i + 1 < offset || shown >= limit {
                continue;
            }
            let line = if line.len() > MAX_LINE_CHARS {
                &line[..MAX_LINE_CHARS]
            } else {
                line
            };
            numbered.push_str(&format!("{:>6}\t{}\n", i + 1, line));
            shown += 1;
        }

        if shown == 0 && total > 0 {
            return ToolOutput::err(format!(
                "Offset {offset} is past the end of the file ({total} lines)"
            ));
        }
        if total == 0 {
            return ToolOutput::ok("(empty file)");
        }
        let remaining = total.saturating_sub(offset - 1 + shown);
        if remaining > 0 {
            numbered.push_str(&format!(
                "[... {remaining} more lines; continue with offset={} ...]\n",
                offset + shown
            ));
        }
        ToolOutput::ok(numbered)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::ToolStatus;

    async fn read(ctx: &ToolContext, args: Value) -> ToolOutput {
        ReadTool.call(&args.to_string(), ctx).await
    }

    #[tokio::test]
    async fn reads_and_numbers_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());

        let out = read(&ctx, json!({ "file_path": "f.txt" })).await;
        assert_eq!(out.status, ToolStatus::Success);
        assert!(out.text.contains("1\talpha"));
        assert!(out.text.contains("2\tbeta"));
        assert!(ctx.file_tracker.contains(&path), "read must track the file");
    }

    #[tokio::test]
    async fn offset_and_limit_window() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=10).map(|i| format!("l{i}\n")).collect();
        std::fs::write(dir.path().join("f.txt"), content).unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());

        let out = read(&ctx, json!({ "file_path": "f.txt", "offset": 4, "limit": 2 })).await;
        assert!(out.text.contains("4\tl4"));
        assert!(out.text.contains("5\tl5"));
        assert!(!out.text.contains("l6"));
        assert!(out.text.contains("offset=6"));
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        let out = read(&ctx, json!({ "file_path": "nope.txt" })).await;
        assert_eq!(out.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn binary_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bin"), [0u8, 159, 146, 150]).unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        let out = read(&ctx, json!({ "file_path": "bin" })).await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.contains("binary"));
    }

    #[tokio::test]
    async fn empty_file_reads_ok() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("e.txt"), "").unwrap();
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        let out = read(&ctx, json!({ "file_path": "e.txt" })).await;
        assert_eq!(out.status, ToolStatus::Success);
        assert!(out.text.contains("empty"));
    }

    #[test]
    fn offload_is_pass_through() {
        assert_eq!(ReadTool.offload(), OffloadStrategy::ReadTool);
    }
}
