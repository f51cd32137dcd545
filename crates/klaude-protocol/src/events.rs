// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{DeveloperMessage, HistoryEvent, ToolResultMessage, UserMessage};
use crate::meta::{TaskMetadataItem, TodoItem, Usage};
use crate::user_interaction::{UserInteractionRequestPayload, UserInteractionSource};

/// An event emitted by the engine for UI consumption.
///
/// Events for a single session are delivered in the order produced by that
/// session's task; events from concurrent sessions interleave but never
/// reorder within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Every event kind the engine produces.
///
/// Within one turn the order is: `TurnStart` → thinking/text deltas in
/// stream order → `ResponseComplete` → `Usage` → tool events in completion
/// order → `TurnEnd`.  `TaskStart` precedes all turn events of its task;
/// `TaskMetadata` then `TaskFinish` follow them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    Welcome {
        workspace: String,
        model_name: String,
    },
    /// Replay of a loaded session's history, event by event.
    ReplayHistory {
        events: Vec<HistoryEvent>,
    },
    UserMessage {
        message: UserMessage,
    },
    DeveloperMessage {
        message: DeveloperMessage,
    },
    TaskStart,
    TurnStart,
    ThinkingStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    ThinkingDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        content: String,
    },
    ThinkingEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    AssistantTextStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    AssistantTextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        content: String,
    },
    AssistantTextEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    /// A generated image was saved to disk while streaming.
    AssistantImageDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        file_path: PathBuf,
    },
    /// Transient: the model opened a tool call.  Not persisted.
    ToolCallStart {
        call_id: String,
        tool_name: String,
    },
    ToolResult {
        message: ToolResultMessage,
        /// True on the final tool result of the turn.
        is_last_in_turn: bool,
    },
    ResponseComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        content: String,
        thinking_text: String,
    },
    Usage {
        usage: Usage,
        model_name: String,
    },
    TodoChange {
        todos: Vec<TodoItem>,
    },
    TurnEnd,
    TaskMetadata {
        item: TaskMetadataItem,
        /// True iff the task ended mid-loop (cancelled, or a turn bailed
        /// before reaching completion).
        is_partial: bool,
    },
    TaskFinish {
        task_result: String,
    },
    Interrupted,
    Error {
        message: String,
        can_retry: bool,
    },
    UserInteractionRequest {
        request_id: String,
        source: UserInteractionSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        payload: UserInteractionRequestPayload,
    },
    End,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
