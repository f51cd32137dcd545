// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent profiles, tools and the supervisor that runs child tasks.
//!
//! A sub-agent tool call recurses into a full [`TaskExecutor`] on a child
//! session.  The child shares the parent's file tracker (so file reads are
//! visible across the tree) and inherits the parent's cancellation token, so
//! interrupting the parent cancels the whole sub-tree.
//!
//! [`TaskExecutor`]: crate::task::TaskExecutor

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use klaude_config::{Config, SubAgentModels};
use klaude_model::{create_client, LLMClient};
use klaude_protocol::{LLMConfig, SubAgentType, ToolResultUIExtra, UserInputPayload};
use klaude_session::{FileTracker, Session, SessionStore};
use klaude_tools::{
    SubAgentInvocation, SubAgentOutcome, SubTaskRunner, Tool, ToolContext, ToolOutput,
};

use crate::agent::{build_registry, Agent};
use crate::events::EventSender;
use crate::interaction::UserInteractionManager;
use crate::prompts::{sub_agent_prompt, REPORT_BACK_INSTRUCTION};
use crate::task::TaskExecutor;

// ─── Profiles ─────────────────────────────────────────────────────────────────

pub struct SubAgentProfile {
    pub kind: SubAgentType,
    pub tool_name: &'static str,
    /// Tool subset available to the child agent.
    pub tool_set: &'static [&'static str],
    /// Hide the tool from models that cannot drive it usefully.
    pub available_for_model: fn(&str) -> bool,
}

fn always(_model: &str) -> bool {
    true
}

fn oracle_models(model: &str) -> bool {
    !model.contains("gpt-5") && !model.contains("gemini-3")
}

static PROFILES: &[SubAgentProfile] = &[
    SubAgentProfile {
        kind: SubAgentType::Task,
        tool_name: "Task",
        tool_set: &["Bash", "Read", "Write", "Edit", "Grep", "Glob", "TodoWrite"],
        available_for_model: always,
    },
    SubAgentProfile {
        kind: SubAgentType::Explore,
        tool_name: "Explore",
        tool_set: &["Bash", "Read", "Grep", "Glob"],
        available_for_model: always,
    },
    SubAgentProfile {
        kind: SubAgentType::Oracle,
        tool_name: "Oracle",
        tool_set: &["Bash", "Read", "Grep", "Glob"],
        available_for_model: oracle_models,
    },
];

pub fn profiles() -> &'static [SubAgentProfile] {
    PROFILES
}

pub fn sub_agent_tool_names() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.tool_name).collect()
}

pub fn is_sub_agent_tool(name: &str) -> bool {
    PROFILES.iter().any(|p| p.tool_name == name)
}

/// Per-model tool filtering for `load_agent_tools`.  Non-sub-agent tools
/// are always available.
pub fn available_for_model(tool_name: &str, model: &str) -> bool {
    match PROFILES.iter().find(|p| p.tool_name == tool_name) {
        Some(profile) => (profile.available_for_model)(model),
        None => true,
    }
}

// ─── Sub-agent tools ──────────────────────────────────────────────────────────

/// The model-facing tool for one sub-agent profile.  Thin by design: it
/// validates arguments and defers to the `SubTaskRunner` seam supplied by
/// the owning task.
pub struct SubAgentTool {
    profile: &'static SubAgentProfile,
}

impl SubAgentTool {
    pub fn new(profile: &'static SubAgentProfile) -> Self {
        Self { profile }
    }
}

#[derive(Deserialize)]
struct SubAgentArgs {
    description: String,
    prompt: String,
    #[serde(default)]
    resume: Option<String>,
    #[serde(default)]
    output_format: Option<Value>,
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        self.profile.tool_name
    }

    fn description(&self) -> &str {
        match self.profile.kind {
            SubAgentType::Task => {
                "Launch a sub-agent to handle a multi-step task autonomously. \
                 The agent works in its own session and returns a single \
                 report; it cannot ask you follow-up questions, so the prompt \
                 must contain everything it needs. Pass `resume` with a \
                 previous sub-agent session id to continue its work, and \
                 `output_format` (a JSON schema) to receive structured output."
            }
            SubAgentType::Explore => {
                "Launch a read-only sub-agent to explore the codebase and \
                 answer a question. Use for broad searches that would flood \
                 the main context with intermediate results."
            }
            SubAgentType::Oracle => {
                "Consult a reasoning sub-agent for a hard design or debugging \
                 question. It reads the code it needs and returns a reasoned \
                 answer; it does not modify anything."
            }
        }
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = json!({
            "description": {
                "type": "string",
                "description": "A short (3-5 word) description of the task"
            },
            "prompt": {
                "type": "string",
                "description": "The full task for the sub-agent to perform"
            }
        });
        if self.profile.kind == SubAgentType::Task {
            properties["resume"] = json!({
                "type": "string",
                "description": "Session id of a previous sub-agent to resume"
            });
            properties["output_format"] = json!({
                "type": "object",
                "description": "JSON schema the sub-agent's result must satisfy"
            });
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["description", "prompt"],
            "additionalProperties": false
        })
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: SubAgentArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        let Some(runner) = &ctx.sub_tasks else {
            return ToolOutput::err("No subtask runner available in this context");
        };
        debug!(kind = %self.profile.kind, description = %args.description, "spawning sub-agent");

        let outcome = match runner
            .run(SubAgentInvocation {
                sub_agent_type: self.profile.kind,
                description: args.description,
                prompt: args.prompt,
                resume: args.resume,
                output_schema: args.output_format,
            })
            .await
        {
            Ok(o) => o,
            Err(e) => return ToolOutput::err(format!("Failed to run subtask: {e}")),
        };

        let mut out = if outcome.error {
            ToolOutput::err(outcome.task_result)
        } else if outcome.task_result.is_empty() {
            ToolOutput::ok("(sub-agent produced no output)")
        } else {
            ToolOutput::ok(outcome.task_result)
        };
        // The child session id lets the UI replay the sub-agent's transcript.
        out.ui_extra = Some(ToolResultUIExtra::SessionId {
            session_id: outcome.session_id,
        });
        out.task_metadata = outcome.metadata;
        out
    }
}

/// Synthetic tool injected into a child's registry when the caller supplied
/// an `output_format` schema.  The last invocation's arguments become the
/// sub-agent's structured result.
pub struct ReportBackTool {
    schema: Value,
    slot: Arc<Mutex<Option<String>>>,
}

impl ReportBackTool {
    pub fn new(schema: Value, slot: Arc<Mutex<Option<String>>>) -> Self {
        Self { schema, slot }
    }
}

#[async_trait]
impl Tool for ReportBackTool {
    fn name(&self) -> &str {
        "ReportBack"
    }

    fn description(&self) -> &str {
        "Report your final result to the caller in the requested structured \
         format. Call exactly once, at the end of the task."
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn call(&self, arguments: &str, _ctx: &ToolContext) -> ToolOutput {
        // Validate it is at least well-formed JSON before accepting.
        if let Err(e) = serde_json::from_str::<Value>(arguments) {
            return ToolOutput::err(format!("Invalid arguments: {e}"));
        }
        *self.slot.lock().expect("report-back slot poisoned") = Some(arguments.to_string());
        ToolOutput::ok("Result recorded.")
    }
}

// ─── Supervisor ───────────────────────────────────────────────────────────────

/// Runs sub-agent invocations as nested tasks.  One supervisor per task;
/// the resume-claims set resets at every turn boundary.
pub struct SubAgentSupervisor {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub events: EventSender,
    pub interactions: Arc<UserInteractionManager>,
    pub parent_client: Arc<dyn LLMClient>,
    pub parent_model_cfg: LLMConfig,
    pub sub_agent_models: SubAgentModels,
    pub parent_tracker: FileTracker,
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
    pub depth: u32,
    claims: Mutex<HashSet<String>>,
}

impl SubAgentSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<SessionStore>,
        events: EventSender,
        interactions: Arc<UserInteractionManager>,
        parent_client: Arc<dyn LLMClient>,
        parent_model_cfg: LLMConfig,
        sub_agent_models: SubAgentModels,
        parent_tracker: FileTracker,
        workdir: PathBuf,
        cancel: CancellationToken,
        depth: u32,
    ) -> Self {
        Self {
            config,
            store,
            events,
            interactions,
            parent_client,
            parent_model_cfg,
            sub_agent_models,
            parent_tracker,
            workdir,
            cancel,
            depth,
            claims: Mutex::new(HashSet::new()),
        }
    }

    /// Clear the per-turn resume claims.  Called at every turn boundary.
    pub fn begin_turn(&self) {
        self.claims.lock().expect("claims poisoned").clear();
    }

    /// Atomically claim `session_id` for resumption this turn.
    fn claim_resume(&self, session_id: &str) -> bool {
        self.claims
            .lock()
            .expect("claims poisoned")
            .insert(session_id.to_string())
    }

    fn resolve_binding(&self, kind: SubAgentType) -> Option<LLMConfig> {
        let name = self.sub_agent_models.get(kind)?;
        self.config.models.bindings.get(name).cloned()
    }
}

#[async_trait]
impl SubTaskRunner for SubAgentSupervisor {
    async fn run(&self, invocation: SubAgentInvocation) -> anyhow::Result<SubAgentOutcome> {
        let kind = invocation.sub_agent_type;

        if self.depth >= self.config.agent.max_sub_agent_depth {
            return Ok(SubAgentOutcome {
                task_result: format!(
                    "maximum sub-agent depth ({}) reached",
                    self.config.agent.max_sub_agent_depth
                ),
                session_id: String::new(),
                error: true,
                has_structured_output: false,
                metadata: None,
            });
        }

        // Duplicate resume claims fail deterministically instead of racing
        // two tasks onto one session.
        if let Some(resume_id) = &invocation.resume {
            if !self.claim_resume(resume_id) {
                return Ok(SubAgentOutcome {
                    task_result: format!(
                        "session {resume_id} already claimed for resume in this turn"
                    ),
                    session_id: resume_id.clone(),
                    error: true,
                    has_structured_output: false,
                    metadata: None,
                });
            }
        }

        // Child session: resumed from disk or fresh; either way it shares
        // the parent's file tracker.
        let mut session = match &invocation.resume {
            Some(resume_id) => {
                let history = self.store.load(resume_id, true)?;
                Session::from_history(resume_id.clone(), self.workdir.clone(), history)
            }
            None => Session::new(self.workdir.clone()),
        };
        session.file_tracker = self.parent_tracker.clone();

        // Model: explicit sub-agent binding, parent's client otherwise.
        let (client, model_cfg) = match self.resolve_binding(kind) {
            Some(cfg) => (create_client(&cfg), cfg),
            None => (
                Arc::clone(&self.parent_client),
                self.parent_model_cfg.clone(),
            ),
        };

        let profile = PROFILES
            .iter()
            .find(|p| p.kind == kind)
            .expect("profile registered for every sub-agent type");
        let mut registry = build_registry(&self.config, &self.workdir, Some(profile.tool_set));

        // Structured output: inject ReportBack and tell the child to finish
        // with it.
        let report_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let mut prompt = invocation.prompt.clone();
        if let Some(schema) = &invocation.output_schema {
            registry.register(ReportBackTool::new(schema.clone(), Arc::clone(&report_slot)));
            prompt.push_str("\n\n");
            prompt.push_str(REPORT_BACK_INSTRUCTION);
        }

        let mut agent = Agent::with_client(
            session,
            client,
            model_cfg,
            Arc::clone(&self.config),
            Arc::clone(&self.store),
        );
        agent.registry = Arc::new(registry);
        let child_session_id = agent.session.id.clone();

        let outcome = TaskExecutor::new(
            &mut agent,
            self.events.for_session(&child_session_id),
            self.cancel.child_token(),
            Arc::clone(&self.interactions),
            self.depth + 1,
            Some(sub_agent_prompt(kind, &self.workdir)),
        )
        .run(UserInputPayload::from_text(prompt))
        .await;

        let structured = report_slot.lock().expect("report-back slot poisoned").take();
        let has_structured_output = structured.is_some();
        let mut metadata = outcome.metadata.main_agent.clone();
        metadata.sub_agent_type = Some(kind);

        Ok(SubAgentOutcome {
            task_result: structured.unwrap_or(outcome.task_result),
            session_id: child_session_id,
            error: matches!(outcome.state, crate::task::TaskState::Failed),
            has_structured_output,
            metadata: Some(metadata),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
