// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tool::{ConcurrencyPolicy, Tool, ToolOutput};

/// Appends to (or replaces) the project's auto-memory file.  The file is
/// tracked as memory so the external-change reminder leaves it alone; the
/// memory-discovery reminder re-emits it when the content changes.
pub struct UpdateMemoryTool {
    pub memory_file: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum MemoryMode {
    Append,
    Replace,
}

#[derive(Deserialize)]
struct UpdateMemoryArgs {
    content: String,
    mode: MemoryMode,
}

#[async_trait]
impl Tool for UpdateMemoryTool {
    fn name(&self) -> &str {
        "UpdateMemory"
    }

    fn description(&self) -> &str {
        "Persist a durable note to the project memory file. Mode `append` \
         adds a section; `replace` rewrites the whole file. Use for facts \
         that should survive this session."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string" },
                "mode": { "type": "string", "enum": ["append", "replace"] }
            },
            "required": ["content", "mode"],
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
        let args: UpdateMemoryArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        if let Some(parent) = self.memory_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(format!("Cannot create {}: {e}", parent.display()));
            }
        }

        let new_content = match args.mode {
            MemoryMode::Replace => args.content,
            MemoryMode::Append => {
                let mut existing = tokio::fs::read_to_string(&self.memory_file)
                    .await
                    .unwrap_or_default();
                if !existing.is_empty() && !existing.ends_with('\n') {
                    existing.push('\n');
                }
                existing.push_str(&args.content);
                if !existing.ends_with('\n') {
                    existing.push('\n');
                }
                existing
            }
        };

        if let Err(e) = tokio::fs::write(&self.memory_file, new_content.as_bytes()).await {
            return ToolOutput::err(format!("Cannot write {}: {e}", self.memory_file.display()));
        }
        ctx.file_tracker
            .record(&self.memory_file, new_content.as_bytes(), true);
        ToolOutput::ok(format!("Memory updated: {}", self.memory_file.display()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::ToolStatus;

    #[tokio::test]
    async fn append_accumulates_sections() {
        let dir = tempfile::tempdir().unwrap();
        let memory_file = dir.path().join("mem/MEMORY.md");
        let tool = UpdateMemoryTool {
            memory_file: memory_file.clone(),
        };
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());

        tool.call(
            &json!({ "content": "- prefers rebase", "mode": "append" }).to_string(),
            &ctx,
        )
        .await;
        let out = tool
            .call(
                &json!({ "content": "- rustfmt on save", "mode": "append" }).to_string(),
                &ctx,
            )
            .await;
        assert_eq!(out.status, ToolStatus::Success);
        let content = std::fs::read_to_string(&memory_file).unwrap();
        assert!(content.contains("prefers rebase"));
        assert!(content.contains("rustfmt on save"));
    }

    #[tokio::test]
    async fn replace_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let memory_file = dir.path().join("MEMORY.md");
        std::fs::write(&memory_file, "old note\n").unwrap();
        let tool = UpdateMemoryTool {
            memory_file: memory_file.clone(),
        };
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());

        tool.call(
            &json!({ "content": "fresh\n", "mode": "replace" }).to_string(),
            &ctx,
        )
        .await;
        assert_eq!(std::fs::read_to_string(&memory_file).unwrap(), "fresh\n");
    }

    #[tokio::test]
    async fn tracked_as_memory_file() {
        let dir = tempfile::tempdir().unwrap();
        let memory_file = dir.path().join("MEMORY.md");
        let tool = UpdateMemoryTool {
            memory_file: memory_file.clone(),
        };
        let ctx = ToolContext::for_testing(dir.path().to_path_buf());
        tool.call(&json!({ "content": "x", "mode": "append" }).to_string(), &ctx)
            .await;
        assert!(ctx.file_tracker.get(&memory_file).unwrap().is_memory);
    }
}
