// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-neutral input pre-pass shared by every adapter.
//!
//! History events carry more than the model may see (checkpoints, interrupt
//! markers, task metadata, stream errors).  This pass reduces a history
//! slice to an ordered list of wire messages: developer messages are
//! attached out-of-band to the nearest prior user or tool message, and a
//! compaction entry renders as a synthetic user message holding its summary.

use klaude_protocol::{
    AssistantMessage, HistoryEvent, Part, ToolResultMessage,
};

/// One provider-bound conversation turn.
#[derive(Debug, Clone)]
pub enum WireMessage {
    System {
        text: String,
    },
    User {
        parts: Vec<Part>,
    },
    Assistant(AssistantMessage),
    /// A tool result plus any developer parts attached after it.
    ToolResult {
        message: ToolResultMessage,
        attached: Vec<Part>,
    },
}

impl WireMessage {
    fn attach(&mut self, extra: Vec<Part>) -> bool {
        match self {
            WireMessage::User { parts } => {
                parts.extend(extra);
                true
            }
            WireMessage::ToolResult { attached, .. } => {
                attached.extend(extra);
                true
            }
            _ => false,
        }
    }
}

/// Reduce history events to wire messages.
///
/// A developer message with no prior user/tool anchor becomes its own user
/// turn — this keeps the first-after-compaction invariant intact (the event
/// after a compaction entry is never a tool result, see the compaction
/// boundary rules).
pub fn to_wire_messages(history: &[HistoryEvent]) -> Vec<WireMessage> {
    let mut out: Vec<WireMessage> = Vec::new();

    for event in history {
        match event {
            HistoryEvent::System(m) => {
                let joined = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");
                out.push(WireMessage::System { text: joined });
            }
            HistoryEvent::User(m) => out.push(WireMessage::User {
                parts: m.parts.clone(),
            }),
            HistoryEvent::Assistant(m) => out.push(WireMessage::Assistant(m.clone())),
            HistoryEvent::ToolResult(m) => out.push(WireMessage::ToolResult {
                message: m.clone(),
                attached: Vec::new(),
            }),
            HistoryEvent::Developer(m) => {
                let parts = m.parts.clone();
                if parts.is_empty() {
                    continue;
                }
                let attached = match out.last_mut() {
                    Some(last) => last.attach(parts.clone()),
                    None => false,
                };
                if !attached {
                    out.push(WireMessage::User { parts });
                }
            }
            HistoryEvent::Compaction(c) => out.push(WireMessage::User {
                parts: vec![Part::text(format!(
                    "Context from the earlier part of this session was summarized:\n\n{}",
                    c.summary
                ))],
            }),
            // Never sent to the model.
            HistoryEvent::StreamError(_)
            | HistoryEvent::TaskMetadata(_)
            | HistoryEvent::Interrupt(_)
            | HistoryEvent::Checkpoint(_) => {}
        }
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
