// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request/response protocol between interactive tools and the user.
//!
//! Requests flow out of the engine as `UserInteractionRequestEvent`s; the
//! answer comes back through the `UserInteractionRespond` operation.  At most
//! one request is pending process-wide at any instant (enforced by the
//! manager in klaude-core, not here).

use serde::{Deserialize, Serialize};

/// Which subsystem raised the interaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserInteractionSource {
    AskUserQuestion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInteractionRequestPayload {
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserInteractionStatus {
    Submitted,
    Cancelled,
}

/// The user's answer.  A `submitted` response must carry a payload; this is
/// validated by the manager when the response is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInteractionResponse {
    pub status: UserInteractionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl UserInteractionResponse {
    pub fn submitted(payload: serde_json::Value) -> Self {
        Self {
            status: UserInteractionStatus::Submitted,
            payload: Some(payload),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: UserInteractionStatus::Cancelled,
            payload: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
