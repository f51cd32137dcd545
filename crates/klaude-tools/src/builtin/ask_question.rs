// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use klaude_protocol::{
    Question, QuestionOption, UserInteractionRequestPayload, UserInteractionSource,
    UserInteractionStatus,
};

use crate::context::ToolContext;
use crate::tool::{Tool, ToolOutput};

/// Asks the user one or more questions through the user-interaction manager
/// and blocks until the answer (or a cancellation) arrives.
#[derive(Default)]
pub struct AskUserQuestionTool;

#[derive(Deserialize)]
struct AskArgs {
    questions: Vec<QuestionArg>,
}

#[derive(Deserialize)]
struct QuestionArg {
    question: String,
    #[serde(default)]
    options: Vec<OptionArg>,
    #[serde(default)]
    multi_select: bool,
}

#[derive(Deserialize)]
struct OptionArg {
    label: String,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl Tool for AskUserQuestionTool {
    fn name(&self) -> &str {
        "AskUserQuestion"
    }

    fn description(&self) -> &str {
        "Ask the user one or more questions and wait for the answers. Use \
         when a decision genuinely requires user input. Provide concise \
         options where possible."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string" },
                            "options": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "label": { "type": "string" },
                                        "description": { "type": "string" }
                                    },
                                    "required": ["label"]
                                }
                            },
                            "multi_select": { "type": "boolean", "default": false }
                        },
                        "required": ["question"]
                    },
                    "minItems": 1
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: AskArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };
        if args.questions.is_empty() {
            return ToolOutput::err("Invalid arguments: questions must not be empty");
        }
        let Some(interactions) = &ctx.interactions else {
            return ToolOutput::err("No user interaction channel available in this context");
        };

        let payload = UserInteractionRequestPayload {
            questions: args
                .questions
                .into_iter()
                .map(|q| Question {
                    question: q.question,
                    options: q
                        .options
                        .into_iter()
                        .map(|o| QuestionOption {
                            label: o.label,
                            description: o.description,
                        })
                        .collect(),
                    multi_select: q.multi_select,
                })
                .collect(),
        };

        let request_id = Uuid::new_v4().simple().to_string();
        let result = interactions
            .request(
                request_id,
                ctx.session_id.clone(),
                UserInteractionSource::AskUserQuestion,
                payload,
                Some(ctx.call_id.clone()),
            )
            .await;

        match result {
            Ok(Some(response)) if response.status == UserInteractionStatus::Submitted => {
                let answers = response
                    .payload
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "{}".into());
                ToolOutput::ok(format!("User responded: {answers}"))
            }
            // Cancelled response or cancelled pending future: controlled
            // decline, and the task stops asking.
            Ok(_) => {
                let mut out = ToolOutput::ok("(User declined to answer questions)");
                out.continue_agent = false;
                out
            }
            Err(e) => ToolOutput::err(format!("User interaction failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InteractionRequester;
    use klaude_protocol::{ToolStatus, UserInteractionResponse};
    use std::path::PathBuf;
    use std::sync::Arc;

    struct ScriptedRequester {
        response: Option<UserInteractionResponse>,
        fail: bool,
    }

    #[async_trait]
    impl InteractionRequester for ScriptedRequester {
        async fn request(
            &self,
            _request_id: String,
            _session_id: String,
            _source: UserInteractionSource,
            _payload: UserInteractionRequestPayload,
            _tool_call_id: Option<String>,
        ) -> anyhow::Result<Option<UserInteractionResponse>> {
            if self.fail {
                anyhow::bail!("Only one user interaction can be pending at a time");
            }
            Ok(self.response.clone())
        }
    }

    fn ctx_with(requester: ScriptedRequester) -> ToolContext {
        let mut ctx = ToolContext::for_testing(PathBuf::from("/tmp"));
        ctx.interactions = Some(Arc::new(requester));
        ctx
    }

    fn args() -> String {
        json!({ "questions": [{ "question": "Proceed?", "options": [{ "label": "yes" }] }] })
            .to_string()
    }

    #[tokio::test]
    async fn submitted_answer_is_returned() {
        let ctx = ctx_with(ScriptedRequester {
            response: Some(UserInteractionResponse::submitted(json!({"answer": "yes"}))),
            fail: false,
        });
        let out = AskUserQuestionTool.call(&args(), &ctx).await;
        assert_eq!(out.status, ToolStatus::Success);
        assert!(out.text.contains("yes"));
        assert!(out.continue_agent);
    }

    #[tokio::test]
    async fn cancellation_declines_and_stops_agent() {
        let ctx = ctx_with(ScriptedRequester {
            response: None,
            fail: false,
        });
        let out = AskUserQuestionTool.call(&args(), &ctx).await;
        assert_eq!(out.status, ToolStatus::Success);
        assert_eq!(out.text, "(User declined to answer questions)");
        assert!(!out.continue_agent);
    }

    #[tokio::test]
    async fn busy_manager_is_tool_error() {
        let ctx = ctx_with(ScriptedRequester {
            response: None,
            fail: true,
        });
        let out = AskUserQuestionTool.call(&args(), &ctx).await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.text.contains("one user interaction"));
    }

    #[tokio::test]
    async fn missing_channel_is_error() {
        let ctx = ToolContext::for_testing(PathBuf::from("/tmp"));
        let out = AskUserQuestionTool.call(&args(), &ctx).await;
        assert_eq!(out.status, ToolStatus::Error);
    }
}
