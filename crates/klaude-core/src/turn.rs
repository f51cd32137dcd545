// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One LLM request: open the stream, surface deltas as events, fan tool
//! calls out through the runner, and append the assistant message plus all
//! tool results to the session.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use klaude_protocol::{
    AssistantMessage, EventPayload, HistoryEvent, LLMCallParameter, LLMStreamItem, Part,
    StopReason, StreamErrorItem, TaskMetadata, Usage,
};
use klaude_model::LLMStream;
use klaude_tools::{InteractionRequester, SubTaskRunner, TodoHandle, ToolContext};

use crate::agent::Agent;
use crate::events::EventSender;
use crate::interaction::UserInteractionManager;
use crate::runner::{ToolCallRequest, ToolRunner};
use crate::sub_agent::SubAgentSupervisor;

#[derive(Debug, Clone)]
pub struct TurnError {
    pub message: String,
    pub can_retry: bool,
}

#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// The task must run another turn (tool results were produced, or the
    /// model signalled an abnormal stop).
    pub continue_agent: bool,
    /// The model returned a normal stop with no tool calls.
    pub task_finished: bool,
    pub cancelled: bool,
    pub error: Option<TurnError>,
    /// Visible assistant text streamed this turn.
    pub final_text: String,
    pub usage: Option<Usage>,
    /// True when a tool wrote the todo list this turn.
    pub touched_todos: bool,
    /// Metadata bubbled up from sub-agent tool results.
    pub sub_agent_metadata: Vec<TaskMetadata>,
}

enum Next {
    Item(anyhow::Result<LLMStreamItem>),
    Cancelled,
    Ended,
}

pub struct TurnExecutor<'a> {
    pub agent: &'a mut Agent,
    pub events: &'a EventSender,
    pub cancel: CancellationToken,
    pub interactions: Arc<UserInteractionManager>,
    pub supervisor: Arc<SubAgentSupervisor>,
    pub runner: &'a ToolRunner,
    pub system_prompt: String,
}

impl<'a> TurnExecutor<'a> {
    pub async fn run(&mut self) -> TurnOutcome {
        self.events.emit(EventPayload::TurnStart);
        self.supervisor.begin_turn();

        let prompt_tokens_estimate = self.agent.session.token_count;
        let param = LLMCallParameter {
            messages: self.agent.session.history.clone(),
            system_prompt: Some(self.system_prompt.clone()),
            tools: self.agent.load_agent_tools(),
            session_id: Some(self.agent.session.id.clone()),
        };

        // The first-token timeout guards stream-open plus the wait for the
        // first yielded item; later silence is the provider's business.
        let timeout = Duration::from_secs_f64(self.agent.config.agent.first_token_timeout_secs);
        let deadline = Instant::now() + timeout;

        let mut stream = match self.open_stream(param, deadline).await {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };

        // ── Stream consumption ───────────────────────────────────────────────
        let mut text_buf = String::new();
        let mut thinking_buf = String::new();
        let mut text_open = false;
        let mut thinking_open = false;
        let mut response_id: Option<String> = None;
        let mut usage: Option<Usage> = None;
        let mut completed: Option<AssistantMessage> = None;
        let mut first_item = true;

        loop {
            let next = if first_item {
                match tokio::time::timeout_at(deadline, next_item(&mut stream, &self.cancel)).await
                {
                    Ok(n) => n,
                    Err(_) => {
                        return self.fail_turn("First token timeout", true).await;
                    }
                }
            } else {
                next_item(&mut stream, &self.cancel).await
            };
            first_item = false;

            match next {
                Next::Cancelled => {
                    drop(stream);
                    return self
                        .finish_cancelled(text_buf, thinking_buf, response_id, text_open, thinking_open)
                        .await;
                }
                Next::Ended => {
                    return self
                        .fail_turn("stream ended without a completed message", true)
                        .await;
                }
                Next::Item(Err(e)) => {
                    warn!(error = %e, "model stream transport error");
                    if !text_buf.is_empty() || !thinking_buf.is_empty() {
                        self.persist_partial(&text_buf, &thinking_buf, &response_id).await;
                    }
                    return self.fail_turn(&format!("stream error: {e}"), true).await;
                }
                Next::Item(Ok(item)) => match item {
                    LLMStreamItem::ThinkingDelta {
                        response_id: rid,
                        content,
                    } => {
                        if response_id.is_none() {
                            response_id = rid.clone();
                        }
                        if !thinking_open {
                            thinking_open = true;
                            self.events.emit(EventPayload::ThinkingStart {
                                response_id: rid.clone(),
                            });
                        }
                        thinking_buf.push_str(&content);
                        self.events.emit(EventPayload::ThinkingDelta {
                            response_id: rid,
                            content,
                        });
                    }
                    LLMStreamItem::TextDelta {
                        response_id: rid,
                        content,
                    } => {
                        if response_id.is_none() {
                            response_id = rid.clone();
                        }
                        if thinking_open {
                            thinking_open = false;
                            self.events.emit(EventPayload::ThinkingEnd {
                                response_id: rid.clone(),
                            });
                        }
                        if !text_open {
                            text_open = true;
                            self.events.emit(EventPayload::AssistantTextStart {
                                response_id: rid.clone(),
                            });
                        }
                        text_buf.push_str(&content);
                        self.events.emit(EventPayload::AssistantTextDelta {
                            response_id: rid,
                            content,
                        });
                    }
                    LLMStreamItem::ToolCallStart {
                        call_id, name, ..
                    } => {
                        self.events.emit(EventPayload::ToolCallStart {
                            call_id,
                            tool_name: name,
                        });
                    }
                    LLMStreamItem::ImageDelta {
                        response_id: rid,
                        file_path,
                    } => {
                        self.events.emit(EventPayload::AssistantImageDelta {
                            response_id: rid,
                            file_path,
                        });
                    }
                    LLMStreamItem::Metadata(meta) => {
                        usage = Some(meta.usage);
                    }
                    LLMStreamItem::StreamError(item) => {
                        warn!(error = %item.error, "model stream error item");
                        self.persist(HistoryEvent::StreamError(item.clone())).await;
                        if !text_buf.is_empty() || !thinking_buf.is_empty() {
                            self.persist_partial(&text_buf, &thinking_buf, &response_id).await;
                        }
                        self.close_open_blocks(&response_id, text_open, thinking_open);
                        self.events.emit(EventPayload::Error {
                            message: item.error.clone(),
                            can_retry: true,
                        });
                        self.events.emit(EventPayload::TurnEnd);
                        return TurnOutcome {
                            error: Some(TurnError {
                                message: item.error,
                                can_retry: true,
                            }),
                            final_text: text_buf,
                            ..Default::default()
                        };
                    }
                    LLMStreamItem::Completed(msg) => {
                        self.close_open_blocks(
                            &msg.response_id.clone().or(response_id.clone()),
                            text_open,
                            thinking_open,
                        );
                        completed = Some(msg);
                        break;
                    }
                },
            }
        }

        let assistant = completed.expect("loop exits with a completed message");
        let stop_reason = assistant.stop_reason.clone().unwrap_or(StopReason::Stop);
        let final_text = assistant.text();
        let usage = usage.or_else(|| assistant.usage.clone());

        self.events.emit(EventPayload::ResponseComplete {
            response_id: assistant.response_id.clone(),
            content: final_text.clone(),
            thinking_text: assistant.thinking_text(),
        });
        self.persist(HistoryEvent::Assistant(assistant.clone())).await;

        if let Some(u) = &usage {
            let actual_input = u.input_tokens + u.cache_read_tokens;
            self.agent
                .session
                .update_calibration(actual_input, prompt_tokens_estimate);
            self.events.emit(EventPayload::Usage {
                usage: u.clone(),
                model_name: self.agent.model_cfg.model_name.clone(),
            });
        }

        // ── Tool fan-out ─────────────────────────────────────────────────────
        let tool_calls: Vec<ToolCallRequest> = assistant
            .tool_calls()
            .into_iter()
            .map(|(call_id, tool_name, arguments_json)| ToolCallRequest {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments_json: arguments_json.to_string(),
            })
            .collect();

        if tool_calls.is_empty() {
            self.events.emit(EventPayload::TurnEnd);
            let finished = matches!(stop_reason, StopReason::Stop);
            return TurnOutcome {
                continue_agent: !matches!(stop_reason, StopReason::Stop | StopReason::Aborted),
                task_finished: finished,
                final_text,
                usage,
                ..Default::default()
            };
        }

        debug!(count = tool_calls.len(), "running tool batch");
        let todos = TodoHandle::seeded(self.agent.session.todos.clone());
        let ctx = ToolContext {
            session_id: self.agent.session.id.clone(),
            workdir: self.agent.session.workdir.clone(),
            file_tracker: self.agent.session.file_tracker.clone(),
            todos: todos.clone(),
            artifacts_dir: self.agent.store.artifacts_dir(&self.agent.session.id),
            cancel: self.cancel.child_token(),
            safety: Arc::clone(&self.agent.safety),
            sub_tasks: Some(Arc::clone(&self.supervisor) as Arc<dyn SubTaskRunner>),
            interactions: Some(Arc::clone(&self.interactions) as Arc<dyn InteractionRequester>),
            call_id: String::new(),
        };
        let batch = self.runner.run_batch(tool_calls, &ctx, self.events).await;

        let mut sub_agent_metadata = Vec::new();
        for result in &batch.results {
            if let Some(meta) = &result.task_metadata {
                sub_agent_metadata.push(meta.clone());
            }
            self.persist(HistoryEvent::ToolResult(result.clone())).await;
        }

        self.agent.session.todos = todos.get();
        let touched_todos = todos.take_dirty();
        if touched_todos {
            self.events.emit(EventPayload::TodoChange {
                todos: self.agent.session.todos.clone(),
            });
        }

        let cancelled = self.cancel.is_cancelled();
        self.events.emit(EventPayload::TurnEnd);
        TurnOutcome {
            continue_agent: batch.continue_agent && !cancelled,
            task_finished: false,
            cancelled,
            error: None,
            final_text,
            usage,
            touched_todos,
            sub_agent_metadata,
        }
    }

    /// Open the stream, retrying once after a short delay on a pre-stream
    /// transport failure.
    async fn open_stream(
        &mut self,
        param: LLMCallParameter,
        deadline: Instant,
    ) -> Result<LLMStream, TurnOutcome> {
        let retry_delay = Duration::from_millis(self.agent.config.agent.retry_delay_ms);
        for attempt in 0..2 {
            match tokio::time::timeout_at(deadline, self.agent.client.call(param.clone())).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) if attempt == 0 => {
                    warn!(error = %e, "model call failed; retrying once");
                    tokio::time::sleep(retry_delay).await;
                }
                Ok(Err(e)) => {
                    return Err(self.fail_turn(&format!("model call failed: {e}"), true).await);
                }
                Err(_) => {
                    return Err(self.fail_turn("First token timeout", true).await);
                }
            }
        }
        unreachable!("loop returns on every path")
    }

    /// Record a stream error, emit the retriable error event and close the
    /// turn.
    async fn fail_turn(&mut self, message: &str, can_retry: bool) -> TurnOutcome {
        self.persist(HistoryEvent::StreamError(StreamErrorItem::new(message)))
            .await;
        self.events.emit(EventPayload::Error {
            message: message.to_string(),
            can_retry,
        });
        self.events.emit(EventPayload::TurnEnd);
        TurnOutcome {
            error: Some(TurnError {
                message: message.to_string(),
                can_retry,
            }),
            ..Default::default()
        }
    }

    /// Interrupt landed mid-stream: commit whatever streamed as an aborted
    /// assistant message, emit the completion event with the partial content
    /// and close the turn.  No usage event — usage may be missing.
    async fn finish_cancelled(
        &mut self,
        text_buf: String,
        thinking_buf: String,
        response_id: Option<String>,
        text_open: bool,
        thinking_open: bool,
    ) -> TurnOutcome {
        self.close_open_blocks(&response_id, text_open, thinking_open);
        if !text_buf.is_empty() || !thinking_buf.is_empty() {
            self.persist_partial(&text_buf, &thinking_buf, &response_id).await;
        }
        self.events.emit(EventPayload::ResponseComplete {
            response_id,
            content: text_buf.clone(),
            thinking_text: thinking_buf,
        });
        self.events.emit(EventPayload::TurnEnd);
        TurnOutcome {
            cancelled: true,
            final_text: text_buf,
            ..Default::default()
        }
    }

    fn close_open_blocks(&self, response_id: &Option<String>, text_open: bool, thinking_open: bool) {
        if thinking_open {
            self.events.emit(EventPayload::ThinkingEnd {
                response_id: response_id.clone(),
            });
        }
        if text_open {
            self.events.emit(EventPayload::AssistantTextEnd {
                response_id: response_id.clone(),
            });
        }
    }

    /// Persist the partial assistant message for an aborted response.
    async fn persist_partial(
        &mut self,
        text_buf: &str,
        thinking_buf: &str,
        response_id: &Option<String>,
    ) {
        let mut parts = Vec::new();
        if !thinking_buf.is_empty() {
            parts.push(Part::ThinkingText {
                text: thinking_buf.to_string(),
            });
        }
        if !text_buf.is_empty() {
            parts.push(Part::text(text_buf));
        }
        let msg = AssistantMessage {
            parts,
            response_id: response_id.clone(),
            usage: None,
            stop_reason: Some(StopReason::Aborted),
        };
        self.persist(HistoryEvent::Assistant(msg)).await;
    }

    async fn persist(&mut self, event: HistoryEvent) {
        let session_id = self.agent.session.id.clone();
        self.agent.session.push(event.clone());
        if let Err(e) = self
            .agent
            .store
            .append_history(&session_id, &[event])
            .await
        {
            warn!(error = %e, "failed to enqueue history append");
        }
    }
}

async fn next_item(stream: &mut LLMStream, cancel: &CancellationToken) -> Next {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Next::Cancelled,
        item = stream.next() => match item {
            Some(i) => Next::Item(i),
            None => Next::Ended,
        },
    }
}
