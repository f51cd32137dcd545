// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History compaction: summarise an old prefix when context nears its limit.
//!
//! The prefix `[0..c)` is replaced in memory by one `CompactionEntry`; the
//! entry is appended to the events log and applied again at load.  A failed
//! summary call aborts the compaction silently — the session keeps running
//! with its full history and the next trigger retries.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use klaude_config::CompactionSettings;
use klaude_protocol::{
    CompactionEntry, HistoryEvent, LLMCallParameter, LLMStreamItem, Part, UserMessage,
};
use klaude_model::LLMClient;
use klaude_session::{Session, SessionStore};

use crate::prompts::COMPACTION_PROMPT;

/// Trigger heuristic: calibrated prompt tokens over the context limit.
/// Tests must not depend on the exact formula — only on the boundary rules
/// below.
pub fn needs_compaction(
    session: &Session,
    cfg: &CompactionSettings,
    context_limit: Option<u64>,
) -> bool {
    if !cfg.enabled {
        return false;
    }
    let Some(limit) = context_limit.filter(|l| *l > 0) else {
        return false;
    };
    session.calibrated_tokens() as f64 / limit as f64 >= cfg.threshold
}

/// Pick the first retained index.
///
/// Constraints: roughly `keep_recent_tokens` of tokens remain; the first
/// retained event is never a tool result (its paired tool call would be
/// summarised away, producing a wire input the provider rejects).  Returns
/// `None` when there is nothing worth summarising.
pub fn choose_first_kept_index(
    history: &[HistoryEvent],
    keep_recent_tokens: usize,
) -> Option<usize> {
    if history.is_empty() {
        return None;
    }
    let mut acc = 0usize;
    let mut first_kept = history.len();
    for (i, ev) in history.iter().enumerate().rev() {
        acc += ev.approx_tokens();
        first_kept = i;
        if acc >= keep_recent_tokens {
            break;
        }
    }
    if first_kept == 0 {
        return None;
    }
    // Advance past tool results so the retained suffix starts on a user
    // message or any other non-tool-result event.
    let mut idx = first_kept;
    while idx < history.len() && matches!(history[idx], HistoryEvent::ToolResult(_)) {
        idx += 1;
    }
    if idx == 0 || idx >= history.len() {
        return None;
    }
    Some(idx)
}

/// Summarise and replace the prefix.  Returns true when compaction was
/// applied.
pub async fn run_compaction(
    session: &mut Session,
    client: &Arc<dyn LLMClient>,
    cfg: &CompactionSettings,
    store: &SessionStore,
) -> bool {
    let Some(first_kept) = choose_first_kept_index(&session.history, cfg.keep_recent_tokens)
    else {
        return false;
    };

    let prefix_text = serialize_history(&session.history[..first_kept]);
    let param = LLMCallParameter {
        messages: vec![HistoryEvent::User(UserMessage::from_text(format!(
            "{COMPACTION_PROMPT}\n\n---\n\n{prefix_text}"
        )))],
        system_prompt: None,
        tools: Vec::new(),
        session_id: Some(session.id.clone()),
    };

    let summary = match summarise(client, param).await {
        Ok(s) if !s.trim().is_empty() => s,
        Ok(_) => {
            warn!("compaction summary was empty; keeping full history");
            return false;
        }
        Err(e) => {
            warn!(error = %e, "compaction model call failed; keeping full history");
            return false;
        }
    };

    let entry = CompactionEntry {
        summary,
        first_kept_index: first_kept,
    };
    let retained = session.history.split_off(first_kept);
    session.history = Vec::with_capacity(retained.len() + 1);
    session.history.push(HistoryEvent::Compaction(entry.clone()));
    session.history.extend(retained);
    session.recalculate_tokens();
    debug!(first_kept, tokens_after = session.token_count, "history compacted");

    if let Err(e) = store
        .append_history(&session.id, &[HistoryEvent::Compaction(entry)])
        .await
    {
        warn!(error = %e, "failed to persist compaction entry");
    }
    true
}

async fn summarise(
    client: &Arc<dyn LLMClient>,
    param: LLMCallParameter,
) -> anyhow::Result<String> {
    let mut stream = client.call(param).await?;
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item? {
            LLMStreamItem::Completed(msg) => {
                text = msg.text();
                break;
            }
            LLMStreamItem::StreamError(e) => anyhow::bail!("stream error: {}", e.error),
            _ => {}
        }
    }
    Ok(text)
}

/// Plain-text rendering of a history slice for the compaction prompt.
fn serialize_history(events: &[HistoryEvent]) -> String {
    events
        .iter()
        .filter_map(|ev| match ev {
            HistoryEvent::User(m) => Some(format!("User: {}", m.text())),
            HistoryEvent::Developer(m) => Some(format!("Context: {}", m.text())),
            HistoryEvent::Assistant(m) => {
                let mut lines = Vec::new();
                let text = m.text();
                if !text.is_empty() {
                    lines.push(format!("Assistant: {text}"));
                }
                for part in &m.parts {
                    if let Part::ToolCall {
                        tool_name,
                        arguments_json,
                        ..
                    } = part
                    {
                        lines.push(format!("Assistant called {tool_name}({arguments_json})"));
                    }
                }
                (!lines.is_empty()).then(|| lines.join("\n"))
            }
            HistoryEvent::ToolResult(m) => {
                Some(format!("Tool {} returned: {}", m.tool_name, m.output_text))
            }
            HistoryEvent::Compaction(c) => Some(format!("Earlier summary: {}", c.summary)),
            HistoryEvent::System(_)
            | HistoryEvent::StreamError(_)
            | HistoryEvent::TaskMetadata(_)
            | HistoryEvent::Interrupt(_)
            | HistoryEvent::Checkpoint(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
