// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios for the task/turn engine.
//!
//! Every scenario drives a real [`TaskExecutor`] against a
//! `ScriptedMockClient`, so the full path — reminders, turn loop, tool
//! runner, sub-agent supervisor, persistence — runs deterministically with
//! no network access.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use klaude_config::Config;
use klaude_model::{LLMClient, LLMStream, ScriptedMockClient};
use klaude_protocol::{
    Event, EventPayload, HistoryEvent, LLMCallParameter, LLMConfig, StopReason, ToolStatus,
    UserInputPayload,
};
use klaude_session::{Session, SessionStore};

use crate::agent::Agent;
use crate::events::EventSender;
use crate::interaction::UserInteractionManager;
use crate::reminder::ReminderPipeline;
use crate::task::{TaskExecutor, TaskState};

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    workdir: PathBuf,
    store: Arc<SessionStore>,
    config: Arc<Config>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    interactions: Arc<UserInteractionManager>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&workdir).expect("workdir");
        let store = Arc::new(SessionStore::new(
            Some(dir.path().join("sessions")),
            &workdir,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let interactions = Arc::new(UserInteractionManager::new(events_tx.clone()));
        Self {
            _dir: dir,
            workdir,
            store,
            config: Arc::new(config),
            events_tx,
            events_rx,
            interactions,
        }
    }

    fn agent(&self, client: Arc<dyn LLMClient>) -> Agent {
        Agent::with_client(
            Session::new(self.workdir.clone()),
            client,
            LLMConfig::mock("scripted-mock-model"),
            Arc::clone(&self.config),
            Arc::clone(&self.store),
        )
    }

    /// Reminder pipeline pinned inside the temp tree so the developer's own
    /// home directory cannot leak into scenarios.
    fn pipeline(&self) -> ReminderPipeline {
        ReminderPipeline::with_search_paths(
            self.config.tools.clone(),
            vec![self.workdir.clone()],
            vec![self.workdir.join(".klaude/skills")],
        )
    }

    async fn run(&self, agent: &mut Agent, text: &str) -> crate::task::TaskOutcome {
        self.run_with_cancel(agent, text, CancellationToken::new())
            .await
    }

    async fn run_with_cancel(
        &self,
        agent: &mut Agent,
        text: &str,
        cancel: CancellationToken,
    ) -> crate::task::TaskOutcome {
        let events = EventSender::new(self.events_tx.clone(), agent.session.id.clone());
        TaskExecutor::new(
            agent,
            events,
            cancel,
            Arc::clone(&self.interactions),
            0,
            None,
        )
        .with_reminders(self.pipeline())
        .run(UserInputPayload::from_text(text))
        .await
    }

    fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events_rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

fn count(events: &[Event], pred: impl Fn(&EventPayload) -> bool) -> usize {
    events.iter().filter(|e| pred(&e.payload)).count()
}

fn position(events: &[Event], pred: impl Fn(&EventPayload) -> bool) -> usize {
    events
        .iter()
        .position(|e| pred(&e.payload))
        .expect("event present")
}

// ── S1: single-turn dialogue ──────────────────────────────────────────────────

#[tokio::test]
async fn single_turn_dialogue() {
    let mut h = Harness::new();
    let mut agent = h.agent(Arc::new(ScriptedMockClient::always_text("hello")));
    let session_id = agent.session.id.clone();

    let outcome = h.run(&mut agent, "hi").await;
    assert_eq!(outcome.state, TaskState::Completed);
    assert_eq!(outcome.task_result, "hello");
    assert!(!outcome.is_partial);

    let events = h.drain();
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TaskStart)), 1);
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TurnStart)), 1);
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TurnEnd)), 1);
    assert_eq!(
        count(&events, |p| matches!(p, EventPayload::AssistantTextStart { .. })),
        1
    );
    assert_eq!(
        count(&events, |p| matches!(p, EventPayload::AssistantTextEnd { .. })),
        1
    );
    let delta_text: String = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::AssistantTextDelta { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(delta_text, "hello");
    assert_eq!(
        count(&events, |p| matches!(p, EventPayload::ResponseComplete { .. })),
        1
    );
    assert_eq!(
        count(&events, |p| matches!(
            p,
            EventPayload::TaskFinish { task_result } if task_result == "hello"
        )),
        1
    );
    assert_eq!(
        count(&events, |p| matches!(
            p,
            EventPayload::TaskMetadata { is_partial: false, .. }
        )),
        1
    );

    // Persisted history: user, checkpoint 0, assistant, task metadata.
    h.store.wait_for_flush(&session_id).await.unwrap();
    let history = h.store.load(&session_id, false).unwrap();
    assert_eq!(history.len(), 4);
    assert!(matches!(&history[0], HistoryEvent::User(m) if m.text() == "hi"));
    assert!(matches!(&history[1], HistoryEvent::Checkpoint(c) if c.id == 0));
    assert!(matches!(&history[2], HistoryEvent::Assistant(m) if m.text() == "hello"));
    assert!(matches!(&history[3], HistoryEvent::TaskMetadata(_)));

    // Reload equals the in-memory history shape.
    assert_eq!(history.len(), agent.session.history.len());
}

// ── S2: tool-call round trip ──────────────────────────────────────────────────

#[tokio::test]
async fn tool_call_round_trip() {
    let mut h = Harness::new();
    let mut agent = h.agent(Arc::new(ScriptedMockClient::tool_then_text(
        "c1",
        "Bash",
        r#"{"command":"echo hi"}"#,
        "done",
    )));

    let outcome = h.run(&mut agent, "run echo").await;
    assert_eq!(outcome.state, TaskState::Completed);
    assert_eq!(outcome.task_result, "done");
    assert!(!outcome.is_partial);
    assert_eq!(outcome.metadata.main_agent.turns, 2);

    let events = h.drain();
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TurnStart)), 2);
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TurnEnd)), 2);

    let tool_results: Vec<(&str, ToolStatus, bool)> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ToolResult {
                message,
                is_last_in_turn,
            } => Some((
                message.call_id.as_str(),
                message.status.clone(),
                *is_last_in_turn,
            )),
            _ => None,
        })
        .collect();
    assert_eq!(tool_results.len(), 1);
    assert_eq!(tool_results[0].0, "c1");
    assert_eq!(tool_results[0].1, ToolStatus::Success);
    assert!(tool_results[0].2, "single result must be last in turn");

    // The tool actually ran: its output is in history, paired after the
    // assistant tool call.
    let call_idx = agent
        .session
        .history
        .iter()
        .position(|e| matches!(e, HistoryEvent::Assistant(m) if m.has_tool_calls()))
        .unwrap();
    let result_idx = agent
        .session
        .history
        .iter()
        .position(|e| matches!(e, HistoryEvent::ToolResult(m) if m.call_id == "c1"))
        .unwrap();
    assert!(result_idx > call_idx);
    match &agent.session.history[result_idx] {
        HistoryEvent::ToolResult(m) => assert_eq!(m.output_text, "hi\n"),
        _ => unreachable!(),
    }

    // Turn-internal ordering: ResponseComplete → Usage → ToolResult → TurnEnd.
    let response_complete = position(&events, |p| matches!(p, EventPayload::ResponseComplete { .. }));
    let usage = position(&events, |p| matches!(p, EventPayload::Usage { .. }));
    let tool_result = position(&events, |p| matches!(p, EventPayload::ToolResult { .. }));
    let first_turn_end = position(&events, |p| matches!(p, EventPayload::TurnEnd));
    assert!(response_complete < usage);
    assert!(usage < tool_result);
    assert!(tool_result < first_turn_end);

    // Task lifecycle ordering: metadata precedes finish, both after turns.
    let metadata = position(&events, |p| matches!(p, EventPayload::TaskMetadata { .. }));
    let finish = position(&events, |p| matches!(p, EventPayload::TaskFinish { .. }));
    assert!(metadata < finish);
    let last_turn_end = events
        .iter()
        .rposition(|e| matches!(e.payload, EventPayload::TurnEnd))
        .unwrap();
    assert!(last_turn_end < metadata);
}

// ── S3: mid-stream interrupt ──────────────────────────────────────────────────

#[tokio::test]
async fn mid_stream_interrupt_persists_partial() {
    let mut h = Harness::new();
    let client = ScriptedMockClient::new(vec![ScriptedMockClient::text_response("partial")])
        .with_item_delay(Duration::from_millis(40));
    let mut agent = h.agent(Arc::new(client));

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            // After the first delta (40 ms) but before the stream finishes.
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        }
    };
    let (outcome, _) = tokio::join!(h.run_with_cancel(&mut agent, "long", cancel.clone()), canceller);

    assert_eq!(outcome.state, TaskState::Cancelled);
    assert_eq!(outcome.task_result, "task cancelled");
    assert!(outcome.is_partial);

    // The partial assistant message is persisted with an aborted stop
    // reason, and no interrupt marker doubles it.
    let aborted = agent.session.history.iter().find_map(|e| match e {
        HistoryEvent::Assistant(m) => Some(m),
        _ => None,
    });
    let aborted = aborted.expect("partial assistant persisted");
    assert_eq!(aborted.text(), "partial");
    assert_eq!(aborted.stop_reason, Some(StopReason::Aborted));
    assert!(
        !agent
            .session
            .history
            .iter()
            .any(|e| matches!(e, HistoryEvent::Interrupt(_))),
        "aborted assistant already records the cancellation"
    );

    let events = h.drain();
    assert_eq!(
        count(&events, |p| matches!(p, EventPayload::Usage { .. })),
        0,
        "no usage event for an aborted response"
    );
    assert_eq!(
        count(&events, |p| matches!(
            p,
            EventPayload::TaskMetadata { is_partial: true, .. }
        )),
        1
    );
    assert_eq!(
        count(&events, |p| matches!(
            p,
            EventPayload::ResponseComplete { content, .. } if content == "partial"
        )),
        1
    );
    assert_eq!(count(&events, |p| matches!(p, EventPayload::Interrupted)), 1);
}

#[tokio::test]
async fn interrupt_before_first_token_appends_interrupt_entry() {
    let mut h = Harness::new();
    let client = ScriptedMockClient::new(vec![ScriptedMockClient::text_response("never seen")])
        .with_item_delay(Duration::from_millis(500));
    let mut agent = h.agent(Arc::new(client));

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        }
    };
    let (outcome, _) = tokio::join!(h.run_with_cancel(&mut agent, "long", cancel.clone()), canceller);

    assert_eq!(outcome.state, TaskState::Cancelled);
    assert!(
        !agent
            .session
            .history
            .iter()
            .any(|e| matches!(e, HistoryEvent::Assistant(_))),
        "nothing streamed, so no assistant message"
    );
    assert!(
        agent
            .session
            .history
            .iter()
            .any(|e| matches!(e, HistoryEvent::Interrupt(_))),
        "interrupt entry records the cancellation instead"
    );
    let _ = h.drain();
}

// ── S4: first-token timeout ───────────────────────────────────────────────────

#[tokio::test]
async fn first_token_timeout_is_retriable_error() {
    let mut config = Config::default();
    config.agent.first_token_timeout_secs = 0.05;
    let mut h = Harness::with_config(config);
    let mut agent = h.agent(Arc::new(ScriptedMockClient::never_yields()));

    let outcome = h.run(&mut agent, "hi").await;
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(outcome.is_partial);
    assert!(outcome.task_result.contains("First token timeout"));

    assert!(
        agent
            .session
            .history
            .iter()
            .any(|e| matches!(e, HistoryEvent::StreamError(s) if s.error.contains("First token timeout"))),
        "stream error is retained at the failing position"
    );

    let events = h.drain();
    assert_eq!(
        count(&events, |p| matches!(
            p,
            EventPayload::Error { message, can_retry: true } if message.contains("First token timeout")
        )),
        1
    );
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TurnEnd)), 1);
    assert_eq!(count(&events, |p| matches!(p, EventPayload::Usage { .. })), 0);
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TaskStart)), 1);
    assert_eq!(count(&events, |p| matches!(p, EventPayload::TaskFinish { .. })), 1);
}

// ── Pre-stream retry ──────────────────────────────────────────────────────────

/// Fails the first `call` with a transport error, then delegates to a
/// scripted client.  Exercises the single pre-stream retry.
struct FlakyClient {
    inner: ScriptedMockClient,
    failures_left: std::sync::Mutex<u32>,
}

#[async_trait]
impl LLMClient for FlakyClient {
    fn name(&self) -> &str {
        "flaky"
    }
    fn model_name(&self) -> &str {
        "flaky-model"
    }
    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("connection reset by peer");
            }
        }
        self.inner.call(param).await
    }
}

#[tokio::test]
async fn transient_call_failure_is_retried_once() {
    let mut config = Config::default();
    config.agent.retry_delay_ms = 1;
    let mut h = Harness::with_config(config);
    let mut agent = h.agent(Arc::new(FlakyClient {
        inner: ScriptedMockClient::always_text("recovered"),
        failures_left: std::sync::Mutex::new(1),
    }));

    let outcome = h.run(&mut agent, "hi").await;
    assert_eq!(outcome.state, TaskState::Completed);
    assert_eq!(outcome.task_result, "recovered");
    let _ = h.drain();
}

#[tokio::test]
async fn persistent_call_failure_fails_the_turn() {
    let mut config = Config::default();
    config.agent.retry_delay_ms = 1;
    let mut h = Harness::with_config(config);
    let mut agent = h.agent(Arc::new(FlakyClient {
        inner: ScriptedMockClient::always_text("unreachable"),
        failures_left: std::sync::Mutex::new(10),
    }));

    let outcome = h.run(&mut agent, "hi").await;
    assert_eq!(outcome.state, TaskState::Failed);
    let events = h.drain();
    assert_eq!(
        count(&events, |p| matches!(p, EventPayload::Error { can_retry: true, .. })),
        1
    );
}

// ── S5: duplicate sub-agent resume claim ──────────────────────────────────────

#[tokio::test]
async fn duplicate_resume_claim_rejected_deterministically() {
    // Repeated runs: the rejection must be deterministic, not a race.
    for _ in 0..3 {
        let mut h = Harness::new();
        let task_args = r#"{"description":"d","prompt":"p","resume":"sess-42"}"#;
        let client = ScriptedMockClient::new(vec![
            ScriptedMockClient::tool_call_response(&[
                ("c1", "Task", task_args),
                ("c2", "Task", task_args),
            ]),
            ScriptedMockClient::text_response("sub-agent reply"),
            ScriptedMockClient::text_response("done"),
        ]);
        let mut agent = h.agent(Arc::new(client));

        let outcome = h.run(&mut agent, "resume twice").await;
        assert_eq!(outcome.state, TaskState::Completed);

        let results: Vec<_> = agent
            .session
            .history
            .iter()
            .filter_map(|e| match e {
                HistoryEvent::ToolResult(m) if m.tool_name == "Task" => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2, "both claims produce a result");
        let errors: Vec<_> = results
            .iter()
            .filter(|m| m.status == ToolStatus::Error)
            .collect();
        assert_eq!(errors.len(), 1, "exactly one claim loses");
        assert!(errors[0].output_text.contains("already claimed"));
        let successes: Vec<_> = results
            .iter()
            .filter(|m| m.status == ToolStatus::Success)
            .collect();
        assert_eq!(successes.len(), 1);
        let _ = h.drain();
    }
}

// ── Sub-agent basics ──────────────────────────────────────────────────────────

#[tokio::test]
async fn explore_sub_agent_returns_report_and_metadata() {
    let mut h = Harness::new();
    let client = ScriptedMockClient::new(vec![
        ScriptedMockClient::tool_call_response(&[(
            "c1",
            "Explore",
            r#"{"description":"find config","prompt":"where is the config loader?"}"#,
        )]),
        ScriptedMockClient::text_response("explored the code"),
        ScriptedMockClient::text_response("final answer"),
    ]);
    let mut agent = h.agent(Arc::new(client));

    let outcome = h.run(&mut agent, "explore").await;
    assert_eq!(outcome.state, TaskState::Completed);
    assert_eq!(outcome.task_result, "final answer");

    let result = agent
        .session
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ToolResult(m) if m.tool_name == "Explore" => Some(m),
            _ => None,
        })
        .expect("explore result persisted");
    assert_eq!(result.status, ToolStatus::Success);
    assert_eq!(result.output_text, "explored the code");
    assert!(matches!(
        result.ui_extra,
        Some(klaude_protocol::ToolResultUIExtra::SessionId { .. })
    ));
    let meta = result.task_metadata.as_ref().expect("metadata bubbled");
    assert_eq!(meta.sub_agent_type, Some(klaude_protocol::SubAgentType::Explore));

    // The sub-agent's accounting is aggregated into the parent's item.
    assert_eq!(outcome.metadata.sub_agent_task_metadata.len(), 1);
    let _ = h.drain();
}

#[tokio::test]
async fn structured_output_uses_report_back() {
    let mut h = Harness::new();
    let task_args = serde_json::json!({
        "description": "count",
        "prompt": "count the tests",
        "output_format": { "type": "object", "properties": { "answer": { "type": "integer" } } }
    })
    .to_string();
    let client = ScriptedMockClient::new(vec![
        // Parent turn 1: spawn the sub-agent.
        ScriptedMockClient::tool_call_response(&[("c1", "Task", &task_args)]),
        // Child turn 1: call the injected ReportBack tool.
        ScriptedMockClient::tool_call_response(&[("r1", "ReportBack", r#"{"answer":42}"#)]),
        // Child turn 2: wrap up in text.
        ScriptedMockClient::text_response("child done"),
        // Parent turn 2: final.
        ScriptedMockClient::text_response("parent done"),
    ]);
    let mut agent = h.agent(Arc::new(client));

    let outcome = h.run(&mut agent, "structured").await;
    assert_eq!(outcome.state, TaskState::Completed);

    let result = agent
        .session
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ToolResult(m) if m.tool_name == "Task" => Some(m),
            _ => None,
        })
        .expect("task result persisted");
    assert_eq!(result.status, ToolStatus::Success);
    assert_eq!(result.output_text, r#"{"answer":42}"#);
    let _ = h.drain();
}

// ── Declined question stops the task ─────────────────────────────────────────

#[tokio::test]
async fn declined_question_ends_task_with_closed_tool_call() {
    let mut h = Harness::new();
    let client = ScriptedMockClient::new(vec![ScriptedMockClient::tool_call_response(&[(
        "c1",
        "AskUserQuestion",
        r#"{"questions":[{"question":"Proceed?"}]}"#,
    )])]);
    let mut agent = h.agent(Arc::new(client));

    let interactions = Arc::clone(&h.interactions);
    let decliner = async move {
        // Wait for the request event to register, then decline.
        loop {
            if interactions.cancel_pending(None) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let (outcome, _) = tokio::join!(h.run(&mut agent, "ask me"), decliner);

    assert_eq!(outcome.state, TaskState::Completed);
    assert!(outcome.is_partial, "declined question is a partial task");

    let result = agent
        .session
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ToolResult(m) => Some(m),
            _ => None,
        })
        .expect("tool call is closed even when declined");
    assert_eq!(result.output_text, "(User declined to answer questions)");
    let _ = h.drain();
}

// ── Compaction end-to-end ─────────────────────────────────────────────────────

#[tokio::test]
async fn compaction_replaces_prefix_and_persists_entry() {
    let h = Harness::new();
    let mut session = Session::new(h.workdir.clone());
    for i in 0..20 {
        session.push(HistoryEvent::User(klaude_protocol::UserMessage::from_text(
            format!("padding message number {i} with some extra length to it"),
        )));
    }
    let last_text = "the most recent message stays";
    session.push(HistoryEvent::User(klaude_protocol::UserMessage::from_text(
        last_text,
    )));
    let session_id = session.id.clone();

    let client: Arc<dyn LLMClient> = Arc::new(ScriptedMockClient::always_text("THE SUMMARY"));
    let cfg = klaude_config::CompactionSettings {
        enabled: true,
        threshold: 0.1,
        keep_recent_tokens: 10,
    };
    let applied = crate::compact::run_compaction(&mut session, &client, &cfg, &h.store).await;
    assert!(applied);

    assert!(matches!(
        &session.history[0],
        HistoryEvent::Compaction(c) if c.summary == "THE SUMMARY"
    ));
    assert!(
        !matches!(&session.history[1], HistoryEvent::ToolResult(_)),
        "first retained event is never a tool result"
    );
    assert!(session
        .history
        .iter()
        .any(|e| matches!(e, HistoryEvent::User(m) if m.text() == last_text)));

    h.store.wait_for_flush(&session_id).await.unwrap();
}

// ── Failed compaction is silent ───────────────────────────────────────────────

#[tokio::test]
async fn failed_compaction_summary_keeps_history() {
    let h = Harness::new();
    let mut session = Session::new(h.workdir.clone());
    for i in 0..20 {
        session.push(HistoryEvent::User(klaude_protocol::UserMessage::from_text(
            format!("padding message number {i} with some extra length to it"),
        )));
    }
    let before = session.history.len();

    // Empty summary → abort silently.
    let client: Arc<dyn LLMClient> = Arc::new(ScriptedMockClient::always_text(""));
    let cfg = klaude_config::CompactionSettings {
        enabled: true,
        threshold: 0.1,
        keep_recent_tokens: 10,
    };
    let applied = crate::compact::run_compaction(&mut session, &client, &cfg, &h.store).await;
    assert!(!applied);
    assert_eq!(session.history.len(), before);
}

// ── Reminders are appended ahead of the turn ─────────────────────────────────

#[tokio::test]
async fn memory_reminder_reaches_history_and_model() {
    let mut h = Harness::new();
    std::fs::write(h.workdir.join("AGENTS.md"), "always run the linter").unwrap();
    let client = Arc::new(ScriptedMockClient::always_text("ok"));
    let last_param = Arc::clone(&client.last_param);
    let mut agent = h.agent(client);

    let outcome = h.run(&mut agent, "hi").await;
    assert_eq!(outcome.state, TaskState::Completed);

    let developer = agent
        .session
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::Developer(m) => Some(m),
            _ => None,
        })
        .expect("memory reminder persisted");
    assert!(developer.text().contains("always run the linter"));
    assert!(developer.text().contains("<system-reminder>"));

    // The reminder was part of the model input.
    let param = last_param.lock().unwrap();
    let sent = param.as_ref().expect("model called");
    assert!(sent
        .messages
        .iter()
        .any(|e| matches!(e, HistoryEvent::Developer(m) if m.text().contains("linter"))));
    let _ = h.drain();
}

// ── Empty input continues without a checkpoint ───────────────────────────────

#[tokio::test]
async fn empty_input_creates_no_user_message_or_checkpoint() {
    let mut h = Harness::new();
    let mut agent = h.agent(Arc::new(ScriptedMockClient::always_text("continuing")));
    agent
        .session
        .push(HistoryEvent::User(klaude_protocol::UserMessage::from_text(
            "earlier",
        )));

    let outcome = h.run(&mut agent, "   ").await;
    assert_eq!(outcome.state, TaskState::Completed);

    let users = agent
        .session
        .history
        .iter()
        .filter(|e| matches!(e, HistoryEvent::User(_)))
        .count();
    assert_eq!(users, 1, "no new user message for a continue");
    assert!(
        !agent
            .session
            .history
            .iter()
            .any(|e| matches!(e, HistoryEvent::Checkpoint(_))),
        "no checkpoint for a continue"
    );
    let _ = h.drain();
}
