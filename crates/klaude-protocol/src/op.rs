// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::ThinkingConfig;
use crate::message::UserInputPayload;
use crate::meta::SubAgentType;
use crate::user_interaction::UserInteractionResponse;

/// A request from the UI to the executor.  Operations for the same session
/// are processed in submission order; cross-session operations may proceed
/// in parallel.  The executor never acknowledges — side effects are observed
/// through events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Load or create a session, build its agent, replay history if loaded.
    InitAgent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Start a task for the session with the given user input.
    RunAgent {
        session_id: String,
        input: UserInputPayload,
    },
    /// Cooperative cancellation.  `session_id = None` interrupts all
    /// sessions.  A no-op when no task is running.
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    ChangeModel {
        session_id: String,
        model_name: String,
        save_as_default: bool,
    },
    ChangeThinking {
        session_id: String,
        thinking: ThinkingConfig,
    },
    ChangeSubAgentModel {
        session_id: String,
        sub_agent_type: SubAgentType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_name: Option<String>,
    },
    /// Replace the agent's session with a fresh one.
    ClearSession { session_id: String },
    /// Load and adopt another session.
    ResumeSession { target_session_id: String },
    /// Deliver the user's answer to a pending interaction request.
    UserInteractionRespond {
        session_id: String,
        request_id: String,
        response: UserInteractionResponse,
    },
    /// Graceful shutdown: drain in-flight tasks with a bounded timeout.
    End,
}

/// A submission wraps an operation with a client-generated id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub op: Operation,
}

impl Submission {
    pub fn new(op: Operation) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            op,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
