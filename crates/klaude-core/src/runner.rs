// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Concurrency-aware fan-out of one turn's tool calls.
//!
//! Results are surfaced to the UI in completion order and returned to the
//! caller in the assistant's submission order, so the persisted history
//! always pairs tool results with tool calls one-to-one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinSet;
use tracing::warn;

use klaude_protocol::{EventPayload, ToolResultMessage, ToolStatus};
use klaude_tools::{postprocess_output, ConcurrencyPolicy, Tool, ToolContext, ToolOutput, ToolRegistry};

use crate::events::EventSender;

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments_json: String,
}

pub struct BatchResult {
    /// One result per request, in submission order.
    pub results: Vec<ToolResultMessage>,
    /// False when any tool asked the task to stop (e.g. declined question).
    pub continue_agent: bool,
}

pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    /// Session-scoped lock: concurrent tools share it read-side, exclusive
    /// tools take it write-side and stall the rest of the batch.
    exclusive: Arc<RwLock<()>>,
    offload_threshold: usize,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>, offload_threshold: usize) -> Self {
        Self {
            registry,
            exclusive: Arc::new(RwLock::new(())),
            offload_threshold,
        }
    }

    /// Run one assistant message's tool calls.  Emits a `ToolResult` event
    /// per completion (the final one flagged `is_last_in_turn`); every
    /// request produces exactly one result even under cancellation.
    pub async fn run_batch(
        &self,
        calls: Vec<ToolCallRequest>,
        ctx: &ToolContext,
        events: &EventSender,
    ) -> BatchResult {
        let total = calls.len();
        let mut slots: Vec<Option<ToolResultMessage>> = vec![None; total];
        let mut continue_agent = true;
        // Submission-order (call_id, tool_name) pairs, kept so a tool task
        // that dies without reporting is still closed under its real id —
        // a fabricated id would orphan the assistant's tool call.
        let idents: Vec<(String, String)> = calls
            .iter()
            .map(|c| (c.call_id.clone(), c.tool_name.clone()))
            .collect();

        let mut join_set: JoinSet<(usize, ToolCallRequest, ToolOutput)> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        // Serial-after-side-effects tools chain among themselves in
        // submission order.  The chain is unconditional: every such builtin
        // also has side effects, so the "once side effects started" guard
        // is satisfied from the first of them onward.
        let mut sas_prev: Option<oneshot::Receiver<()>> = None;

        for (index, call) in calls.into_iter().enumerate() {
            let tool = self.registry.get(&call.tool_name);
            let exclusive = Arc::clone(&self.exclusive);
            let mut tool_ctx = ctx.clone();
            tool_ctx.call_id = call.call_id.clone();
            let threshold = self.offload_threshold;

            let sas_wait = match tool.as_deref().map(Tool::concurrency) {
                Some(ConcurrencyPolicy::SerialAfterSideEffects) => {
                    let wait = sas_prev.take();
                    let (done_tx, done_rx) = oneshot::channel();
                    sas_prev = Some(done_rx);
                    Some((wait, done_tx))
                }
                _ => None,
            };

            let handle = join_set.spawn(async move {
                let output = run_one(tool, &call, tool_ctx, exclusive, sas_wait, threshold).await;
                (index, call, output)
            });
            task_index.insert(handle.id(), index);
        }

        let mut completed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            completed += 1;
            let (index, call_id, tool_name, output) = match joined {
                Ok((index, call, output)) => (index, call.call_id, call.tool_name, output),
                Err(e) => {
                    // A panic that escaped run_one's guards.  Recover the
                    // submission index from the task id so the call is
                    // closed under its real id, not a fabricated one.
                    warn!(error = %e, "tool task join error");
                    let Some(&index) = task_index.get(&e.id()) else {
                        continue;
                    };
                    let (call_id, tool_name) = idents[index].clone();
                    let output = ToolOutput::err(format!("tool {tool_name} panicked: {e}"));
                    (index, call_id, tool_name, output)
                }
            };
            if !output.continue_agent {
                continue_agent = false;
            }
            let message = ToolResultMessage {
                call_id,
                tool_name,
                status: output.status,
                output_text: output.text,
                parts: output.parts,
                ui_extra: output.ui_extra,
                task_metadata: output.task_metadata,
            };
            events.emit(EventPayload::ToolResult {
                message: message.clone(),
                is_last_in_turn: completed == total,
            });
            slots[index] = Some(message);
        }

        let results = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    let (call_id, tool_name) = idents[i].clone();
                    ToolResultMessage {
                        call_id,
                        tool_name,
                        status: ToolStatus::Error,
                        output_text: "tool task produced no result".into(),
                        parts: vec![],
                        ui_extra: None,
                        task_metadata: None,
                    }
                })
            })
            .collect();

        BatchResult {
            results,
            continue_agent,
        }
    }
}

async fn run_one(
    tool: Option<Arc<dyn Tool>>,
    call: &ToolCallRequest,
    ctx: ToolContext,
    exclusive: Arc<RwLock<()>>,
    sas_wait: Option<(Option<oneshot::Receiver<()>>, oneshot::Sender<()>)>,
    offload_threshold: usize,
) -> ToolOutput {
    let Some(tool) = tool else {
        return ToolOutput::err(format!("unknown tool: {}", call.tool_name));
    };

    // Chain behind the previous serial-after-side-effects tool, if any.
    let sas_done = match sas_wait {
        Some((Some(prev), done_tx)) => {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    let _ = done_tx.send(());
                    return ToolOutput::aborted();
                }
                _ = prev => {}
            }
            Some(done_tx)
        }
        Some((None, done_tx)) => Some(done_tx),
        None => None,
    };

    // Exclusive tools drain the batch; everyone else shares the lock.
    let output = match tool.concurrency() {
        ConcurrencyPolicy::Exclusive => {
            let _guard = exclusive.write().await;
            execute_cancellable(&*tool, call, &ctx).await
        }
        _ => {
            let _guard = exclusive.read().await;
            execute_cancellable(&*tool, call, &ctx).await
        }
    };

    if let Some(done_tx) = sas_done {
        let _ = done_tx.send(());
    }

    // Offload post-processing is guarded like the tool body: a panic here
    // would unwind the whole task and leave the assistant's tool call
    // without a paired result.
    let mut output = output;
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        postprocess_output(
            &output.text,
            tool.offload(),
            offload_threshold,
            &ctx.artifacts_dir,
            &call.call_id,
        )
    })) {
        Ok(text) => output.text = text,
        Err(_) => {
            warn!(
                tool_name = %call.tool_name,
                call_id = %call.call_id,
                "offload post-processing panicked; keeping raw output"
            );
        }
    }
    output
}

async fn execute_cancellable(
    tool: &dyn Tool,
    call: &ToolCallRequest,
    ctx: &ToolContext,
) -> ToolOutput {
    let fut = std::panic::AssertUnwindSafe(tool.call(&call.arguments_json, ctx)).catch_unwind();
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => ToolOutput::aborted(),
        result = fut => match result {
            Ok(output) => output,
            Err(_) => ToolOutput::err(format!("tool {} panicked", call.tool_name)),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
