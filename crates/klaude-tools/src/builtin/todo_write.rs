// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use klaude_protocol::{TodoItem, TodoStatus, ToolResultUIExtra};

use crate::context::ToolContext;
use crate::tool::{ConcurrencyPolicy, Tool, ToolOutput};

/// Replaces the session's todo list.  The handle marks itself dirty so the
/// staleness reminder stays quiet for the following turn.
#[derive(Default)]
pub struct TodoWriteTool;

#[derive(Deserialize)]
struct TodoWriteArgs {
    todos: Vec<TodoArg>,
}

#[derive(Deserialize)]
struct TodoArg {
    content: String,
    status: TodoStatus,
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "TodoWrite"
    }

    fn description(&self) -> &str {
        "Replace the task list for the current session. Use it to plan \
         multi-step work and mark items in_progress/completed as you go."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["content", "status"]
                    }
                }
            },
            "required": ["todos"],
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
        let args: TodoWriteArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        let todos: Vec<TodoItem> = args
            .todos
            .into_iter()
            .map(|t| TodoItem {
                content: t.content,
                status: t.status,
            })
            .collect();
        let in_progress = todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return ToolOutput::err("At most one todo may be in_progress at a time");
        }
        ctx.todos.set(todos.clone());

        let done = todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        ToolOutput::ok(format!(
            "Todo list updated: {} item(s), {} completed",
            todos.len(),
            done
        ))
        .with_ui_extra(ToolResultUIExtra::Todos { todos })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::ToolStatus;
    use std::path::PathBuf;

    #[tokio::test]
    async fn replaces_list_and_marks_dirty() {
        let ctx = ToolContext::for_testing(PathBuf::from("/tmp"));
        let out = TodoWriteTool
            .call(
                &json!({ "todos": [
                    { "content": "first", "status": "in_progress" },
                    { "content": "second", "status": "pending" }
                ]})
                .to_string(),
                &ctx,
            )
            .await;
        assert_eq!(out.status, ToolStatus::Success);
        assert_eq!(ctx.todos.get().len(), 2);
        assert!(ctx.todos.take_dirty());
        assert!(matches!(out.ui_extra, Some(ToolResultUIExtra::Todos { .. })));
    }

    #[tokio::test]
    async fn rejects_multiple_in_progress() {
        let ctx = ToolContext::for_testing(PathBuf::from("/tmp"));
        let out = TodoWriteTool
            .call(
                &json!({ "todos": [
                    { "content": "a", "status": "in_progress" },
                    { "content": "b", "status": "in_progress" }
                ]})
                .to_string(),
                &ctx,
            )
            .await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(ctx.todos.get().is_empty(), "rejected write must not apply");
    }

    #[tokio::test]
    async fn invalid_status_is_invalid_arguments() {
        let ctx = ToolContext::for_testing(PathBuf::from("/tmp"));
        let out = TodoWriteTool
            .call(
                &json!({ "todos": [{ "content": "a", "status": "paused" }] }).to_string(),
                &ctx,
            )
            .await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.starts_with("Invalid arguments:"));
    }
}
