// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scoped execution context handed to tools.
//!
//! Tools never see the full session.  They get the file tracker, a todo
//! handle, the cancellation token and — where the owning task provides them
//! — interface-only seams for running sub-agents and asking the user.  The
//! seams break the Turn ↔ Tool-Runner ↔ Sub-Agent ↔ Task cycle: the tools
//! crate defines the traits, the core crate implements them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use klaude_protocol::{
    SubAgentType, TaskMetadata, TodoItem, UserInteractionRequestPayload, UserInteractionResponse,
    UserInteractionSource,
};
use klaude_session::FileTracker;

use crate::safety::CommandSafety;

/// Todo access handed to tools: read the list, replace the list.  The dirty
/// flag feeds the todo-staleness reminder.
#[derive(Debug, Clone, Default)]
pub struct TodoHandle {
    inner: Arc<Mutex<TodoState>>,
}

#[derive(Debug, Default)]
struct TodoState {
    todos: Vec<TodoItem>,
    dirty: bool,
}

impl TodoHandle {
    pub fn seeded(todos: Vec<TodoItem>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TodoState {
                todos,
                dirty: false,
            })),
        }
    }

    pub fn get(&self) -> Vec<TodoItem> {
        self.inner.lock().expect("todo handle poisoned").todos.clone()
    }

    pub fn set(&self, todos: Vec<TodoItem>) {
        let mut state = self.inner.lock().expect("todo handle poisoned");
        state.todos = todos;
        state.dirty = true;
    }

    /// Returns whether `set` was called since the last take, clearing the flag.
    pub fn take_dirty(&self) -> bool {
        let mut state = self.inner.lock().expect("todo handle poisoned");
        std::mem::take(&mut state.dirty)
    }
}

/// A request to run a nested agent, raised by a sub-agent tool.
#[derive(Debug, Clone)]
pub struct SubAgentInvocation {
    pub sub_agent_type: SubAgentType,
    pub description: String,
    pub prompt: String,
    /// Resume an existing child session.  At most one claim per session id
    /// per turn; duplicates fail deterministically.
    pub resume: Option<String>,
    /// JSON schema for structured output; injects a ReportBack tool into the
    /// child's tool set.
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SubAgentOutcome {
    pub task_result: String,
    pub session_id: String,
    pub error: bool,
    pub has_structured_output: bool,
    pub metadata: Option<TaskMetadata>,
}

/// Supplied by the owning task; runs a nested task to completion.
#[async_trait]
pub trait SubTaskRunner: Send + Sync {
    async fn run(&self, invocation: SubAgentInvocation) -> anyhow::Result<SubAgentOutcome>;
}

/// Supplied by the process-global user-interaction manager.
///
/// `Ok(None)` means the pending request was cancelled (the user declined);
/// `Err` means the request could not be admitted (another one is pending).
#[async_trait]
pub trait InteractionRequester: Send + Sync {
    async fn request(
        &self,
        request_id: String,
        session_id: String,
        source: UserInteractionSource,
        payload: UserInteractionRequestPayload,
        tool_call_id: Option<String>,
    ) -> anyhow::Result<Option<UserInteractionResponse>>;
}

/// Everything a tool may touch.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub workdir: PathBuf,
    pub file_tracker: FileTracker,
    pub todos: TodoHandle,
    /// Per-session overflow directory for offloaded outputs.
    pub artifacts_dir: PathBuf,
    pub cancel: CancellationToken,
    pub safety: Arc<CommandSafety>,
    pub sub_tasks: Option<Arc<dyn SubTaskRunner>>,
    pub interactions: Option<Arc<dyn InteractionRequester>>,
    /// The call id of the tool invocation currently executing.
    pub call_id: String,
}

impl ToolContext {
    /// Minimal context for tests and detached tool runs.
    pub fn for_testing(workdir: PathBuf) -> Self {
        Self {
            session_id: "test-session".into(),
            artifacts_dir: workdir.join("artifacts"),
            workdir,
            file_tracker: FileTracker::new(),
            todos: TodoHandle::default(),
            cancel: CancellationToken::new(),
            safety: Arc::new(CommandSafety::default()),
            sub_tasks: None,
            interactions: None,
            call_id: "test-call".into(),
        }
    }

    /// Resolve a possibly-relative path against the session workdir.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.workdir.join(p)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
