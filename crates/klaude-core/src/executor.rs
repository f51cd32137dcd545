// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Operation dispatcher: the single entry point for the embedding UI.
//!
//! Operations arrive on one queue and are handled in submission order;
//! `RunAgent` spawns the task onto the runtime so operations for other
//! sessions keep flowing, while `Interrupt` reaches a running task through
//! its cancellation token without touching the agent lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use klaude_config::Config;
use klaude_protocol::{
    Event, EventPayload, LLMConfig, Operation, Submission, UserInputPayload,
};
use klaude_session::{Session, SessionStore};

use crate::agent::Agent;
use crate::events::EventSender;
use crate::interaction::UserInteractionManager;
use crate::task::TaskExecutor;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct AgentHandle {
    agent: Arc<Mutex<Agent>>,
    running: Option<Running>,
}

impl AgentHandle {
    fn is_busy(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }
}

pub struct Executor {
    config: Arc<Config>,
    workdir: PathBuf,
    store: Arc<SessionStore>,
    events_tx: mpsc::UnboundedSender<Event>,
    interactions: Arc<UserInteractionManager>,
    agents: HashMap<String, AgentHandle>,
    /// Runtime default binding name (`ChangeModel` with `save_as_default`).
    default_model: Option<String>,
}

impl Executor {
    pub fn new(config: Arc<Config>, workdir: PathBuf) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(SessionStore::new(config.sessions_root.clone(), &workdir));
        let interactions = Arc::new(UserInteractionManager::new(events_tx.clone()));
        let default_model = config.models.default.clone();
        (
            Self {
                config,
                workdir,
                store,
                events_tx,
                interactions,
                agents: HashMap::new(),
                default_model,
            },
            events_rx,
        )
    }

    pub fn interactions(&self) -> Arc<UserInteractionManager> {
        Arc::clone(&self.interactions)
    }

    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// Drive the executor until `End` (or the submission queue closes).
    pub async fn run(mut self, mut submissions: mpsc::UnboundedReceiver<Submission>) {
        while let Some(submission) = submissions.recv().await {
            debug!(op = ?submission.op, "handling operation");
            if !self.handle_operation(submission.op).await {
                break;
            }
        }
    }

    fn emit(&self, session_id: &str, payload: EventPayload) {
        let _ = self
            .events_tx
            .send(Event::new(session_id.to_string(), payload));
    }

    fn resolve_model(&self, name: Option<&str>) -> LLMConfig {
        let key = name.or(self.default_model.as_deref());
        match self.config.model_binding(key) {
            Some(cfg) => cfg.clone(),
            None => {
                // No binding configured: fall back to the mock adapter so
                // the engine stays drivable (tests, dry runs).
                warn!(binding = ?key, "no model binding found; using mock");
                LLMConfig::mock("mock-model")
            }
        }
    }

    /// Returns false when the executor should stop (`End`).
    pub async fn handle_operation(&mut self, op: Operation) -> bool {
        match op {
            Operation::InitAgent { session_id } => {
                self.init_agent(session_id).await;
            }
            Operation::RunAgent { session_id, input } => {
                self.run_agent(&session_id, input);
            }
            Operation::Interrupt { session_id } => {
                self.interrupt(session_id.as_deref());
            }
            Operation::ChangeModel {
                session_id,
                model_name,
                save_as_default,
            } => {
                let cfg = match self.config.models.bindings.get(&model_name) {
                    Some(cfg) => cfg.clone(),
                    None => {
                        self.emit(
                            &session_id,
                            EventPayload::Error {
                                message: format!("unknown model binding: {model_name}"),
                                can_retry: false,
                            },
                        );
                        return true;
                    }
                };
                if save_as_default {
                    self.default_model = Some(model_name);
                }
                self.with_idle_agent(&session_id, |agent| agent.set_model(cfg));
            }
            Operation::ChangeThinking {
                session_id,
                thinking,
            } => {
                self.with_idle_agent(&session_id, |agent| {
                    let mut cfg = agent.model_cfg.clone();
                    cfg.thinking = Some(thinking);
                    agent.set_model(cfg);
                });
            }
            Operation::ChangeSubAgentModel {
                session_id,
                sub_agent_type,
                model_name,
            } => {
                self.with_idle_agent(&session_id, |agent| {
                    agent.sub_agent_models.set(sub_agent_type, model_name);
                });
            }
            Operation::ClearSession { session_id } => {
                self.clear_session(&session_id);
            }
            Operation::ResumeSession { target_session_id } => {
                self.init_agent(Some(target_session_id)).await;
            }
            Operation::UserInteractionRespond {
                session_id,
                request_id,
                response,
            } => {
                if let Err(e) = self.interactions.respond(&request_id, &session_id, response) {
                    self.emit(
                        &session_id,
                        EventPayload::Error {
                            message: e.to_string(),
                            can_retry: false,
                        },
                    );
                }
            }
            Operation::End => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    async fn init_agent(&mut self, session_id: Option<String>) {
        let (session, replay) = match &session_id {
            Some(id) => match self.store.load(id, true) {
                Ok(history) => {
                    let replay = (!history.is_empty()).then(|| history.clone());
                    (
                        Session::from_history(id.clone(), self.workdir.clone(), history),
                        replay,
                    )
                }
                Err(e) => {
                    self.emit(
                        id,
                        EventPayload::Error {
                            message: format!("failed to load session: {e}"),
                            can_retry: false,
                        },
                    );
                    return;
                }
            },
            None => (Session::new(self.workdir.clone()), None),
        };

        let model_cfg = self.resolve_model(None);
        let sid = session.id.clone();
        let agent = Agent::new(
            session,
            model_cfg.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.store),
        );

        self.emit(
            &sid,
            EventPayload::Welcome {
                workspace: self.workdir.display().to_string(),
                model_name: model_cfg.model_name.clone(),
            },
        );
        if let Some(events) = replay {
            self.emit(&sid, EventPayload::ReplayHistory { events });
        }

        self.agents.insert(
            sid,
            AgentHandle {
                agent: Arc::new(Mutex::new(agent)),
                running: None,
            },
        );
    }

    fn run_agent(&mut self, session_id: &str, input: UserInputPayload) {
        let Some(handle) = self.agents.get_mut(session_id) else {
            self.emit(
                session_id,
                EventPayload::Error {
                    message: format!("unknown session: {session_id}"),
                    can_retry: false,
                },
            );
            return;
        };
        if handle.is_busy() {
            self.emit(
                session_id,
                EventPayload::Error {
                    message: "a task is already running for this session".into(),
                    can_retry: false,
                },
            );
            return;
        }

        let cancel = CancellationToken::new();
        let agent = Arc::clone(&handle.agent);
        let events = EventSender::new(self.events_tx.clone(), session_id.to_string());
        let interactions = Arc::clone(&self.interactions);
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let mut agent = agent.lock().await;
            let outcome =
                TaskExecutor::new(&mut agent, events, task_cancel, interactions, 0, None)
                    .run(input)
                    .await;
            debug!(state = ?outcome.state, "task finished");
        });

        handle.running = Some(Running {
            cancel,
            handle: join,
        });
    }

    fn interrupt(&mut self, session_id: Option<&str>) {
        for (id, handle) in self.agents.iter() {
            if session_id.map_or(true, |target| target == id) {
                if let Some(running) = &handle.running {
                    if !running.handle.is_finished() {
                        debug!(session_id = %id, "interrupting task");
                        running.cancel.cancel();
                    }
                }
            }
        }
        // Unblock any tool waiting on a user answer in the targeted scope.
        self.interactions.cancel_pending(session_id);
    }

    /// Apply a mutation to an idle agent; running sessions reject the
    /// operation instead of blocking the dispatch loop.
    fn with_idle_agent(&mut self, session_id: &str, f: impl FnOnce(&mut Agent)) {
        let Some(handle) = self.agents.get(session_id) else {
            self.emit(
                session_id,
                EventPayload::Error {
                    message: format!("unknown session: {session_id}"),
                    can_retry: false,
                },
            );
            return;
        };
        match handle.agent.try_lock() {
            Ok(mut agent) => f(&mut agent),
            Err(_) => {
                self.emit(
                    session_id,
                    EventPayload::Error {
                        message: "session is busy; retry after the task finishes".into(),
                        can_retry: true,
                    },
                );
            }
        }
    }

    fn clear_session(&mut self, session_id: &str) {
        let Some(handle) = self.agents.remove(session_id) else {
            self.emit(
                session_id,
                EventPayload::Error {
                    message: format!("unknown session: {session_id}"),
                    can_retry: false,
                },
            );
            return;
        };
        let new_id_and_model = match handle.agent.try_lock() {
            Ok(mut agent) => {
                let fresh = Session::new(self.workdir.clone());
                let new_id = fresh.id.clone();
                agent.replace_session(fresh);
                let model_name = agent.model_cfg.model_name.clone();
                Some((new_id, model_name))
            }
            Err(_) => None,
        };
        match new_id_and_model {
            Some((new_id, model_name)) => {
                self.emit(
                    &new_id,
                    EventPayload::Welcome {
                        workspace: self.workdir.display().to_string(),
                        model_name,
                    },
                );
                self.agents.insert(
                    new_id,
                    AgentHandle {
                        agent: handle.agent,
                        running: None,
                    },
                );
            }
            None => {
                self.emit(
                    session_id,
                    EventPayload::Error {
                        message: "session is busy; interrupt it before clearing".into(),
                        can_retry: true,
                    },
                );
                self.agents.insert(session_id.to_string(), handle);
            }
        }
    }

    /// Drain in-flight tasks with a bounded grace period, then cancel and
    /// flush every session log.
    async fn shutdown(&mut self) {
        let grace = Duration::from_secs_f64(self.config.agent.shutdown_grace_secs);
        self.interactions.cancel_pending(None);

        for (id, mut handle) in self.agents.drain() {
            if let Some(running) = handle.running.take() {
                let mut join = running.handle;
                if !join.is_finished() {
                    if tokio::time::timeout(grace, &mut join).await.is_err() {
                        warn!(session_id = %id, "task did not drain in time; cancelling");
                        running.cancel.cancel();
                        if tokio::time::timeout(grace, &mut join).await.is_err() {
                            join.abort();
                        }
                    }
                }
            }
            if let Err(e) = self.store.wait_for_flush(&id).await {
                warn!(session_id = %id, error = %e, "flush on shutdown failed");
            }
        }
        self.emit("executor", EventPayload::End);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
