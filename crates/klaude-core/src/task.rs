// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One user request, end to end: reminders, the turn loop, cancellation,
//! metadata accounting and the task lifecycle events.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use klaude_protocol::{
    EventPayload, HistoryEvent, InterruptEntry, StopReason, TaskMetadata, TaskMetadataItem,
    UserInputPayload, UserMessage, Usage,
};

use crate::agent::Agent;
use crate::compact;
use crate::events::EventSender;
use crate::interaction::UserInteractionManager;
use crate::prompts;
use crate::reminder::ReminderPipeline;
use crate::runner::ToolRunner;
use crate::sub_agent::SubAgentSupervisor;
use crate::turn::TurnExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub task_result: String,
    pub metadata: TaskMetadataItem,
    pub is_partial: bool,
}

pub struct TaskExecutor<'a> {
    agent: &'a mut Agent,
    events: EventSender,
    cancel: CancellationToken,
    interactions: Arc<UserInteractionManager>,
    depth: u32,
    system_prompt_override: Option<String>,
    reminders: Option<ReminderPipeline>,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(
        agent: &'a mut Agent,
        events: EventSender,
        cancel: CancellationToken,
        interactions: Arc<UserInteractionManager>,
        depth: u32,
        system_prompt_override: Option<String>,
    ) -> Self {
        Self {
            agent,
            events,
            cancel,
            interactions,
            depth,
            system_prompt_override,
            reminders: None,
        }
    }

    /// Replace the default reminder pipeline (tests pin its search paths).
    pub fn with_reminders(mut self, reminders: ReminderPipeline) -> Self {
        self.reminders = Some(reminders);
        self
    }

    pub async fn run(mut self, input: UserInputPayload) -> TaskOutcome {
        let started = Instant::now();
        let mut turns = 0u32;
        let mut usage_total = Usage::default();
        let mut sub_agent_metadata: Vec<TaskMetadata> = Vec::new();
        let mut last_text = String::new();
        let mut last_turn_touched_todos = false;

        // Empty input is a "continue": no new user message, no checkpoint.
        if !input.is_empty() {
            let snapshot = input.text.clone();
            let message = UserMessage {
                parts: input.into_parts(),
                created_at: chrono::Utc::now(),
            };
            self.events.emit(EventPayload::UserMessage {
                message: message.clone(),
            });
            self.push_and_persist(HistoryEvent::User(message)).await;
            let checkpoint = self.agent.session.create_checkpoint(&snapshot);
            self.persist_only(HistoryEvent::Checkpoint(checkpoint)).await;
        }

        let reminders = self.reminders.take().unwrap_or_else(|| {
            ReminderPipeline::new(&self.agent.session.workdir, self.agent.config.tools.clone())
        });

        self.events.emit(EventPayload::TaskStart);

        let system_prompt = self.system_prompt_override.clone().unwrap_or_else(|| {
            prompts::system_prompt(
                &self.agent.session.workdir,
                &self.agent.model_cfg.model_name,
            )
        });
        let supervisor = Arc::new(SubAgentSupervisor::new(
            Arc::clone(&self.agent.config),
            Arc::clone(&self.agent.store),
            self.events.clone(),
            Arc::clone(&self.interactions),
            Arc::clone(&self.agent.client),
            self.agent.model_cfg.clone(),
            self.agent.sub_agent_models.clone(),
            self.agent.session.file_tracker.clone(),
            self.agent.session.workdir.clone(),
            self.cancel.clone(),
            self.depth,
        ));
        let runner = ToolRunner::new(
            Arc::clone(&self.agent.registry),
            self.agent.config.tools.offload_threshold_bytes,
        );

        let mut state = TaskState::Completed;
        let mut finished_normally = false;
        let mut failure: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() {
                state = TaskState::Cancelled;
                break;
            }
            let max_turns = self.agent.config.agent.max_turns;
            if max_turns > 0 && turns >= max_turns {
                warn!(max_turns, "turn budget exhausted; stopping task");
                break;
            }

            // Between-turn compaction keeps the next request under the
            // window; a failed summary call is silent.
            let compaction = self.agent.config.compaction.clone();
            if compact::needs_compaction(
                &self.agent.session,
                &compaction,
                self.agent.model_cfg.context_limit,
            ) {
                compact::run_compaction(
                    &mut self.agent.session,
                    &self.agent.client,
                    &compaction,
                    &self.agent.store,
                )
                .await;
            }

            // Reminders run before every turn; whatever they return is
            // appended as developer messages (the pipeline itself never
            // mutates the conversation).
            for message in reminders.run(&self.agent.session, last_turn_touched_todos) {
                self.events.emit(EventPayload::DeveloperMessage {
                    message: message.clone(),
                });
                self.push_and_persist(HistoryEvent::Developer(message)).await;
            }

            turns += 1;
            let outcome = TurnExecutor {
                agent: &mut *self.agent,
                events: &self.events,
                cancel: self.cancel.clone(),
                interactions: Arc::clone(&self.interactions),
                supervisor: Arc::clone(&supervisor),
                runner: &runner,
                system_prompt: system_prompt.clone(),
            }
            .run()
            .await;

            if let Some(usage) = &outcome.usage {
                usage_total.merge(usage);
            }
            sub_agent_metadata.extend(outcome.sub_agent_metadata);
            last_turn_touched_todos = outcome.touched_todos;
            if !outcome.final_text.is_empty() {
                last_text = outcome.final_text;
            }

            if outcome.cancelled {
                state = TaskState::Cancelled;
                break;
            }
            if let Some(error) = outcome.error {
                state = TaskState::Failed;
                failure = Some(error.message);
                break;
            }
            if outcome.task_finished {
                finished_normally = true;
                break;
            }
            if !outcome.continue_agent {
                debug!("turn requested stop; ending task early");
                break;
            }
        }

        if state == TaskState::Cancelled {
            // An aborted assistant message already records the cancellation;
            // only append an interrupt marker when there is none.
            if !self.last_assistant_is_aborted() {
                self.push_and_persist(HistoryEvent::Interrupt(InterruptEntry::default()))
                    .await;
            }
            self.events.emit(EventPayload::Interrupted);
        }

        let task_result = match state {
            TaskState::Cancelled => "task cancelled".to_string(),
            TaskState::Failed => failure.unwrap_or_else(|| "task failed".to_string()),
            TaskState::Completed => last_text.clone(),
        };
        let is_partial = !(state == TaskState::Completed && finished_normally);

        let metadata = TaskMetadataItem {
            main_agent: TaskMetadata {
                session_id: self.agent.session.id.clone(),
                sub_agent_type: None,
                model_name: self.agent.model_cfg.model_name.clone(),
                usage: usage_total,
                turns,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            sub_agent_task_metadata: sub_agent_metadata,
        };
        self.push_and_persist(HistoryEvent::TaskMetadata(metadata.clone()))
            .await;
        self.events.emit(EventPayload::TaskMetadata {
            item: metadata.clone(),
            is_partial,
        });
        self.events.emit(EventPayload::TaskFinish {
            task_result: task_result.clone(),
        });

        if let Err(e) = self.agent.store.update_index(&self.agent.session) {
            warn!(error = %e, "failed to update session index");
        }

        TaskOutcome {
            state,
            task_result,
            metadata,
            is_partial,
        }
    }

    fn last_assistant_is_aborted(&self) -> bool {
        self.agent
            .session
            .history
            .iter()
            .rev()
            .find_map(|e| match e {
                HistoryEvent::Assistant(m) => Some(m.stop_reason == Some(StopReason::Aborted)),
                _ => None,
            })
            .unwrap_or(false)
    }

    async fn push_and_persist(&mut self, event: HistoryEvent) {
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

    async fn persist_only(&mut self, event: HistoryEvent) {
        let session_id = self.agent.session.id.clone();
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
