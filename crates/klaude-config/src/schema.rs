// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use klaude_protocol::{LLMConfig, SubAgentType};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub compaction: CompactionSettings,
    #[serde(default)]
    pub tools: ToolsSettings,
    /// Root for session logs and artifacts.  Default: `~/.klaude/sessions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_root: Option<PathBuf>,
}

/// Named model bindings plus the default and per-sub-agent selections.
///
/// ```yaml
/// models:
///   default: main
///   bindings:
///     main:
///       protocol: anthropic
///       model_name: claude-sonnet-4-5
///     cheap:
///       protocol: openai_chat
///       model_name: gpt-4o-mini
///       base_url: http://localhost:11434/v1
///   sub_agents:
///     explore: cheap
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub bindings: HashMap<String, LLMConfig>,
    #[serde(default)]
    pub sub_agents: SubAgentModels,
}

/// Per-sub-agent model binding names.  Unset entries fall back to the main
/// agent's model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubAgentModels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle: Option<String>,
}

impl SubAgentModels {
    pub fn get(&self, kind: SubAgentType) -> Option<&str> {
        match kind {
            SubAgentType::Task => self.task.as_deref(),
            SubAgentType::Explore => self.explore.as_deref(),
            SubAgentType::Oracle => self.oracle.as_deref(),
        }
    }

    pub fn set(&mut self, kind: SubAgentType, name: Option<String>) {
        match kind {
            SubAgentType::Task => self.task = name,
            SubAgentType::Explore => self.explore = name,
            SubAgentType::Oracle => self.oracle = name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Seconds allowed between opening the stream and the first yielded
    /// item.  Silence after the first item is not timed.
    #[serde(default = "AgentSettings::default_first_token_timeout_secs")]
    pub first_token_timeout_secs: f64,
    /// Delay before the single automatic pre-stream retry.
    #[serde(default = "AgentSettings::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Hard cap on turns per task; 0 disables the cap.
    #[serde(default = "AgentSettings::default_max_turns")]
    pub max_turns: u32,
    /// Seconds `End` waits for in-flight tasks before cancelling them.
    #[serde(default = "AgentSettings::default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,
    /// Maximum sub-agent nesting depth.
    #[serde(default = "AgentSettings::default_max_sub_agent_depth")]
    pub max_sub_agent_depth: u32,
}

impl AgentSettings {
    fn default_first_token_timeout_secs() -> f64 {
        30.0
    }
    fn default_retry_delay_ms() -> u64 {
        500
    }
    fn default_max_turns() -> u32 {
        200
    }
    fn default_shutdown_grace_secs() -> f64 {
        5.0
    }
    fn default_max_sub_agent_depth() -> u32 {
        3
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            first_token_timeout_secs: Self::default_first_token_timeout_secs(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            max_turns: Self::default_max_turns(),
            shutdown_grace_secs: Self::default_shutdown_grace_secs(),
            max_sub_agent_depth: Self::default_max_sub_agent_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Compact when prompt tokens ÷ context limit exceeds this fraction.
    #[serde(default = "CompactionSettings::default_threshold")]
    pub threshold: f64,
    /// Roughly this many tokens of recent history survive a compaction.
    #[serde(default = "CompactionSettings::default_keep_recent_tokens")]
    pub keep_recent_tokens: usize,
}

impl CompactionSettings {
    fn default_threshold() -> f64 {
        0.85
    }
    fn default_keep_recent_tokens() -> usize {
        20_000
    }
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: Self::default_threshold(),
            keep_recent_tokens: Self::default_keep_recent_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSettings {
    /// Shell command timeout.
    #[serde(default = "ToolsSettings::default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
    /// Tool outputs above this many bytes are offloaded to the session's
    /// artifacts directory and replaced by a head-tail extract.
    #[serde(default = "ToolsSettings::default_offload_threshold_bytes")]
    pub offload_threshold_bytes: usize,
    /// Commands matching any of these globs run without confirmation.
    #[serde(default = "ToolsSettings::default_allow_patterns")]
    pub allow_patterns: Vec<String>,
    /// Commands matching any of these globs are refused outright.
    /// Deny beats allow when both match.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Maximum bytes read for one `@file` mention.
    #[serde(default = "ToolsSettings::default_at_file_max_bytes")]
    pub at_file_max_bytes: usize,
}

impl ToolsSettings {
    fn default_shell_timeout_secs() -> u64 {
        120
    }
    fn default_offload_threshold_bytes() -> usize {
        32 * 1024
    }
    fn default_allow_patterns() -> Vec<String> {
        ["cat *", "ls*", "rg *", "grep *", "git status*", "git diff*"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
    fn default_at_file_max_bytes() -> usize {
        256 * 1024
    }
}

impl Default for ToolsSettings {
    fn default() -> Self {
        Self {
            shell_timeout_secs: Self::default_shell_timeout_secs(),
            offload_threshold_bytes: Self::default_offload_threshold_bytes(),
            allow_patterns: Self::default_allow_patterns(),
            deny_patterns: Vec::new(),
            at_file_max_bytes: Self::default_at_file_max_bytes(),
        }
    }
}

impl Config {
    /// Resolve a binding by name, falling back to the configured default.
    pub fn model_binding(&self, name: Option<&str>) -> Option<&LLMConfig> {
        let key = name.or(self.models.default.as_deref())?;
        self.models.bindings.get(key)
    }

    /// Resolve a sub-agent's model binding: explicit configuration first,
    /// main model otherwise.
    pub fn sub_agent_binding(&self, kind: SubAgentType) -> Option<&LLMConfig> {
        match self.models.sub_agents.get(kind) {
            Some(name) => self.models.bindings.get(name),
            None => self.model_binding(None),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
