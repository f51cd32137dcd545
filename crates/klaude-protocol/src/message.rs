// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{TaskMetadata, TaskMetadataItem, ToolResultUIExtra, Usage};

// ─── Content parts ────────────────────────────────────────────────────────────

/// A single content part of a message.
///
/// Images are data URLs (`data:<mime>;base64,<b64>`) or HTTPS URLs when the
/// part is `image_url`, and on-disk references when the part is `image_file`
/// (generated images are persisted before the delta is emitted).  Thinking
/// text and its provider signature are separate parts so adapters can pair
/// them per their own wire rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ImageUrl {
        url: String,
    },
    ImageFile {
        file_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        byte_size: Option<u64>,
    },
    ThinkingText {
        text: String,
    },
    ThinkingSignature {
        signature: String,
        /// Provider-specific signature format tag (e.g. encrypted reasoning
        /// from the Responses API vs an inline Anthropic signature).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        /// JSON-encoded argument object, exactly as streamed by the model.
        arguments_json: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl { url: url.into() }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments_json: impl Into<String>,
    ) -> Self {
        Self::ToolCall {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments_json: arguments_json.into(),
        }
    }

    /// Approximate token cost of this part (4 chars per token; images use a
    /// flat conservative estimate).
    pub fn approx_tokens(&self) -> usize {
        match self {
            Part::Text { text } | Part::ThinkingText { text } => text.len() / 4,
            Part::ThinkingSignature { signature, .. } => signature.len() / 4,
            Part::ToolCall {
                tool_name,
                arguments_json,
                ..
            } => (tool_name.len() + arguments_json.len()) / 4,
            Part::ImageUrl { .. } | Part::ImageFile { .. } => 765,
        }
    }
}

/// Concatenate the plain-text parts of a message.
pub fn join_text_parts(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

pub(crate) fn parts_from_text(text: &str) -> Vec<Part> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Part::text(text)]
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    ToolUse,
    MaxTokens,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
}

impl UserMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: parts_from_text(&text.into()),
            created_at: Utc::now(),
        }
    }

    pub fn text(&self) -> String {
        join_text_parts(&self.parts)
    }
}

/// Extra fields carried by a developer message for UI rendering only.
/// The model sees the text parts; the UI uses these to render compact
/// reminder summaries instead of the raw `<system-reminder>` blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeveloperUIExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_paths: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_file_changes: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_files: Option<Vec<AtFileResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_name: Option<String>,
}

/// Outcome of resolving one `@path` mention from the user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtFileResult {
    pub pattern: String,
    pub path: PathBuf,
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// System reminders and command output.  Attached out-of-band to the prior
/// user or tool message when building provider input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperMessage {
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_extra: Option<DeveloperUIExtra>,
}

impl DeveloperMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: parts_from_text(&text.into()),
            ui_extra: None,
        }
    }

    pub fn text(&self) -> String {
        join_text_parts(&self.parts)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl AssistantMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: parts_from_text(&text.into()),
            ..Default::default()
        }
    }

    /// The assistant's visible text (thinking excluded).
    pub fn text(&self) -> String {
        join_text_parts(&self.parts)
    }

    pub fn thinking_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ThinkingText { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls in streamed order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    call_id,
                    tool_name,
                    arguments_json,
                } => Some((call_id.as_str(), tool_name.as_str(), arguments_json.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall { .. }))
    }
}

/// Result of a single tool call.  `parts` may carry image parts produced by
/// the tool; plain text always lives in `output_text`, never in `parts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_extra: Option<ToolResultUIExtra>,
    /// Sub-agent task metadata, bubbled up for the parent's accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_metadata: Option<TaskMetadata>,
}

/// Rare explicit system-prompt override recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    pub parts: Vec<Part>,
}

// ─── Non-message history records ──────────────────────────────────────────────

/// A mid-stream provider failure, retained so a retry can be performed
/// against the same history position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorItem {
    pub error: String,
    pub created_at: DateTime<Utc>,
}

impl StreamErrorItem {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            created_at: Utc::now(),
        }
    }
}

/// Marks that history below `first_kept_index` was replaced by `summary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEntry {
    pub summary: String,
    pub first_kept_index: usize,
}

/// Records a user-originated cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptEntry {
    pub created_at: DateTime<Utc>,
}

impl Default for InterruptEntry {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
        }
    }
}

/// A resumable point in the session.  Ids are strictly increasing per
/// session; reverting to checkpoint k drops every later event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: u64,
    pub user_message_snapshot: String,
    pub created_at: DateTime<Utc>,
}

// ─── History ──────────────────────────────────────────────────────────────────

/// One persisted record of a session's conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    User(UserMessage),
    Developer(DeveloperMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    System(SystemMessage),
    StreamError(StreamErrorItem),
    TaskMetadata(TaskMetadataItem),
    Compaction(CompactionEntry),
    Interrupt(InterruptEntry),
    Checkpoint(CheckpointEntry),
}

impl HistoryEvent {
    /// Approximate token cost of this event for context budgeting.
    pub fn approx_tokens(&self) -> usize {
        let parts_cost = |parts: &[Part]| parts.iter().map(Part::approx_tokens).sum::<usize>();
        match self {
            HistoryEvent::User(m) => parts_cost(&m.parts),
            HistoryEvent::Developer(m) => parts_cost(&m.parts),
            HistoryEvent::Assistant(m) => parts_cost(&m.parts),
            HistoryEvent::System(m) => parts_cost(&m.parts),
            HistoryEvent::ToolResult(m) => m.output_text.len() / 4 + parts_cost(&m.parts),
            HistoryEvent::Compaction(c) => c.summary.len() / 4,
            HistoryEvent::StreamError(_)
            | HistoryEvent::TaskMetadata(_)
            | HistoryEvent::Interrupt(_)
            | HistoryEvent::Checkpoint(_) => 0,
        }
    }

    /// True for events that are sent to the model (directly or attached).
    pub fn is_model_input(&self) -> bool {
        matches!(
            self,
            HistoryEvent::User(_)
                | HistoryEvent::Developer(_)
                | HistoryEvent::Assistant(_)
                | HistoryEvent::ToolResult(_)
                | HistoryEvent::System(_)
                | HistoryEvent::Compaction(_)
        )
    }
}

// ─── User input ───────────────────────────────────────────────────────────────

/// Structured user input carried unchanged through UI → executor → task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInputPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl UserInputPayload {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: None,
        }
    }

    /// A "continue" submission: no new user message, no new checkpoint.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.as_ref().map_or(true, |v| v.is_empty())
    }

    pub fn into_parts(self) -> Vec<Part> {
        let mut parts = parts_from_text(&self.text);
        if let Some(images) = self.images {
            parts.extend(images.into_iter().map(Part::image_url));
        }
        parts
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
