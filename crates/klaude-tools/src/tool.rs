// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use klaude_protocol::{Part, TaskMetadata, ToolResultUIExtra, ToolStatus};

use crate::context::ToolContext;

/// How the runner may schedule a tool relative to others in the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Runs in parallel with anything.
    #[default]
    Concurrent,
    /// Once any side-effectful tool has started, tools of this policy run
    /// sequentially in submission order.
    SerialAfterSideEffects,
    /// Acquires the session-scoped mutex; everything else in the batch waits.
    Exclusive,
}

/// What the offload policy does to this tool's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffloadStrategy {
    /// Pass through unchanged (file reads manage their own windowing).
    ReadTool,
    /// Head-tail truncate above the threshold and spill the full output to
    /// the session's artifacts directory, embedding the path.
    #[default]
    OnThreshold,
    /// Head-tail truncate only, no artifact file.
    TruncateOnly,
}

/// What a tool hands back to the runner.  The runner pairs it with the
/// originating call id to build the persisted result message.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ToolStatus,
    pub text: String,
    /// Image parts produced by the tool; text never goes here.
    pub parts: Vec<Part>,
    pub ui_extra: Option<ToolResultUIExtra>,
    /// Set by sub-agent tools so the parent task can aggregate accounting.
    pub task_metadata: Option<TaskMetadata>,
    /// False when the task should stop after this result (e.g. the user
    /// declined to answer a question).
    pub continue_agent: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            text: text.into(),
            parts: Vec::new(),
            ui_extra: None,
            task_metadata: None,
            continue_agent: true,
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            text: text.into(),
            ..Self::ok("")
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: ToolStatus::Aborted,
            text: "task cancelled".into(),
            ..Self::ok("")
        }
    }

    pub fn with_ui_extra(mut self, extra: ToolResultUIExtra) -> Self {
        self.ui_extra = Some(extra);
        self
    }
}

/// Trait every builtin and injected tool implements.
///
/// Tools never raise: failures are error-status outputs, and cancellation is
/// observed through the context's token and answered with an aborted output
/// (the runner also maps cancelled tasks to aborted results so the
/// assistant's tool-call list is always closed).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the argument object.
    fn parameters_schema(&self) -> Value;
    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Concurrent
    }
    fn has_side_effects(&self) -> bool {
        false
    }
    fn offload(&self) -> OffloadStrategy {
        OffloadStrategy::OnThreshold
    }
    /// Execute with raw JSON arguments.  Argument validation failures are
    /// error outputs of the form `Invalid arguments: …`.
    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_output_continues_agent() {
        let out = ToolOutput::ok("fine");
        assert_eq!(out.status, ToolStatus::Success);
        assert!(out.continue_agent);
    }

    #[test]
    fn aborted_output_is_task_cancelled() {
        let out = ToolOutput::aborted();
        assert_eq!(out.status, ToolStatus::Aborted);
        assert_eq!(out.text, "task cancelled");
    }

    #[test]
    fn default_policies() {
        assert_eq!(ConcurrencyPolicy::default(), ConcurrencyPolicy::Concurrent);
        assert_eq!(OffloadStrategy::default(), OffloadStrategy::OnThreshold);
    }
}
