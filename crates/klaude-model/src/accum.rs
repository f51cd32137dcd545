// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use tracing::warn;

use klaude_protocol::Part;

/// Accumulates streamed tool-call fragments into ordered tool-call parts.
///
/// OpenAI-style providers interleave chunks for parallel tool calls keyed by
/// an `index` field; id and name arrive once, argument JSON arrives in
/// fragments split at arbitrary byte boundaries.  Other providers always use
/// index 0 per content block.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: HashMap<u32, PendingToolCall>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment.  Empty id/name fields never overwrite previously
    /// seen values.  Returns `Some((call_id, name))` the first time a call
    /// becomes identifiable, so the caller can emit a transient
    /// tool-call-start item exactly once.
    pub fn push(
        &mut self,
        index: u32,
        id: &str,
        name: &str,
        arguments: &str,
    ) -> Option<(String, String)> {
        let ptc = self.pending.entry(index).or_default();
        let was_identified = !ptc.id.is_empty() && !ptc.name.is_empty();
        if !id.is_empty() {
            ptc.id = id.to_string();
        }
        if !name.is_empty() {
            ptc.name = name.to_string();
        }
        ptc.args_buf.push_str(arguments);

        let identified = !ptc.id.is_empty() && !ptc.name.is_empty();
        if identified && !was_identified {
            Some((ptc.id.clone(), ptc.name.clone()))
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush accumulated calls as tool-call parts, ordered by index.
    ///
    /// A call with an empty name cannot be dispatched and is dropped —
    /// persisting it would corrupt the history sent back on the next turn.
    /// An empty id gets a synthetic fallback so the turn can still close.
    /// Empty argument buffers become `{}` (providers reject non-object
    /// input on replay).
    pub fn finish(self) -> Vec<Part> {
        let mut sorted: Vec<(u32, PendingToolCall)> = self.pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);

        let mut parts = Vec::with_capacity(sorted.len());
        for (i, (_, ptc)) in sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let call_id = if ptc.id.is_empty() {
                let synthetic = format!("call_synthetic_{i}");
                warn!(tool_name = %ptc.name, call_id = %synthetic, "tool call had empty id; generated synthetic id");
                synthetic
            } else {
                ptc.id
            };
            let arguments_json = if ptc.args_buf.trim().is_empty() {
                "{}".to_string()
            } else {
                ptc.args_buf
            };
            parts.push(Part::ToolCall {
                call_id,
                tool_name: ptc.name,
                arguments_json,
            });
        }
        parts
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
