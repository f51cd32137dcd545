// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Token usage for one model response (or an aggregate of several).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache (read hit).
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    /// Milliseconds until the first streamed item, measured by the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_latency_ms: Option<u64>,
    /// Output tokens per second over the whole response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_tps: Option<f64>,
}

impl Usage {
    /// Fold another usage into this one.  Counters add; first-token latency
    /// keeps the first measurement, throughput keeps the latest.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        if self.first_token_latency_ms.is_none() {
            self.first_token_latency_ms = other.first_token_latency_ms;
        }
        if other.throughput_tps.is_some() {
            self.throughput_tps = other.throughput_tps;
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.output_tokens
    }
}

// ─── Task metadata ────────────────────────────────────────────────────────────

/// Per-task accounting published once per user turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_agent_type: Option<SubAgentType>,
    pub model_name: String,
    pub usage: Usage,
    pub turns: u32,
    pub duration_ms: u64,
}

/// One per user turn: the main agent's accounting plus every sub-agent that
/// ran inside the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadataItem {
    pub main_agent: TaskMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_agent_task_metadata: Vec<TaskMetadata>,
}

/// The built-in sub-agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentType {
    Task,
    Explore,
    Oracle,
}

impl std::fmt::Display for SubAgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubAgentType::Task => write!(f, "task"),
            SubAgentType::Explore => write!(f, "explore"),
            SubAgentType::Oracle => write!(f, "oracle"),
        }
    }
}

// ─── Todos ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

// ─── Tool result UI hints ─────────────────────────────────────────────────────

/// UI hints attached to a tool result.  Tagged so the engine stays free of
/// renderer code while the UI can pick a specialised presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultUIExtra {
    /// Sub-agent tools attach the child session id for replay drill-down.
    SessionId { session_id: String },
    /// Edit tools attach a unified diff preview.
    Diff { path: String, diff: String },
    /// Todo writes attach the full new list.
    Todos { todos: Vec<TodoItem> },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
