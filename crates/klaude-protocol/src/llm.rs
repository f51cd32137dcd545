// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::message::{AssistantMessage, HistoryEvent, StreamErrorItem};
use crate::meta::Usage;

/// Streaming wire protocol an adapter implements.  Providers that share a
/// wire format (Bedrock, Vertex, Codex, Copilot) bind to one of these with
/// their own base URL and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LLMProtocol {
    Anthropic,
    OpenaiChat,
    Responses,
    Openrouter,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingEffort {
    Low,
    Medium,
    High,
}

/// Reasoning parameters forwarded to adapters that support them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub enabled: bool,
    /// Anthropic-style explicit thinking budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
    /// Responses-style effort hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<ThinkingEffort>,
}

/// One model binding: which adapter to construct and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub protocol: LLMProtocol,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Context window used by the compaction heuristic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    /// Display name when the binding is not the protocol's canonical host
    /// (e.g. "bedrock" riding the anthropic codec).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
}

impl LLMConfig {
    pub fn mock(model_name: impl Into<String>) -> Self {
        Self {
            protocol: LLMProtocol::Mock,
            model_name: model_name.into(),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            context_limit: None,
            thinking: None,
            provider_name: None,
        }
    }
}

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: serde_json::Value,
}

/// One LLM request: the history to convert, the system prompt and the tools.
/// Input conversion (grouping, developer-message attachment, compaction
/// rendering) is owned by the adapter.
#[derive(Debug, Clone, Default)]
pub struct LLMCallParameter {
    pub messages: Vec<HistoryEvent>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    /// Stable session identifier for providers with explicit cache keys.
    pub session_id: Option<String>,
}

/// Usage and identity for one response, emitted once near the end of the
/// stream (before or after `Completed`, adapter-dependent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadataItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub provider: String,
    pub model_name: String,
    pub usage: Usage,
}

/// The unified stream item every adapter yields.
///
/// `Completed` terminates the stream for its response id and must arrive
/// after every delta for that id.  `ToolCallStart` is transient: the UI shows
/// "Calling Bash …" from it, but it is never persisted.
#[derive(Debug, Clone)]
pub enum LLMStreamItem {
    TextDelta {
        response_id: Option<String>,
        content: String,
    },
    ThinkingDelta {
        response_id: Option<String>,
        content: String,
    },
    ToolCallStart {
        response_id: Option<String>,
        call_id: String,
        name: String,
    },
    /// An inline generated image has been persisted to disk.
    ImageDelta {
        response_id: Option<String>,
        file_path: PathBuf,
    },
    Completed(AssistantMessage),
    StreamError(StreamErrorItem),
    Metadata(ResponseMetadataItem),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
