// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tool::{ConcurrencyPolicy, Tool, ToolOutput};

/// Writes a file, creating parent directories as needed.  Overwriting an
/// existing file requires that it was read this session (the tracker has a
/// record), so the model cannot clobber content it has never seen.
#[derive(Default)]
pub struct WriteTool;

#[derive(Deserialize)]
struct WriteArgs {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "Write"
    }

    fn description(&self) -> &str {
        "Write a file to the filesystem, overwriting if it exists. \
         Overwriting an existing file requires reading it first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["file_path", "content"],
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
        let args: WriteArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        let path = ctx.resolve_path(&args.file_path);

        if path.exists() && !ctx.file_tracker.contains(&path) {
            return ToolOutput::err(format!(
                "{} exists but has not been read in this session; read it first",
                path.display()
            ));
        }
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(format!("Cannot create {}: {e}", parent.display()));
            }
        }
        if let Err(e) = tokio::fs::write(&path, args.content.as_bytes()).await {
            return ToolOutput::err(format!("Cannot write {}: {e}", path.display()));
        }
        ctx.file_tracker.record(&path, args.content.as_bytes(), false);
        ToolOutput::ok(format!(
            "Wrote {} bytes to {}",
            args.content.len(),
            path.display()
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
