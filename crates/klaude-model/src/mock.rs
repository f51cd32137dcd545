// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use klaude_protocol::{
    AssistantMessage, HistoryEvent, LLMCallParameter, LLMStreamItem, Part, ResponseMetadataItem,
    StopReason, Usage,
};

use crate::client::{LLMClient, LLMStream};

fn mock_usage() -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: 10,
        ..Default::default()
    }
}

/// Deterministic mock: echoes the last user message back as the response.
#[derive(Default)]
pub struct MockClient;

#[async_trait]
impl LLMClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        let reply = param
            .messages
            .iter()
            .rev()
            .find_map(|e| match e {
                HistoryEvent::User(m) => Some(m.text()),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());
        let text = format!("MOCK: {reply}");

        let items: Vec<anyhow::Result<LLMStreamItem>> = vec![
            Ok(LLMStreamItem::TextDelta {
                response_id: None,
                content: text.clone(),
            }),
            Ok(LLMStreamItem::Metadata(ResponseMetadataItem {
                response_id: None,
                provider: "mock".into(),
                model_name: "mock-model".into(),
                usage: mock_usage(),
            })),
            Ok(LLMStreamItem::Completed(AssistantMessage {
                parts: vec![Part::text(text)],
                response_id: None,
                usage: Some(mock_usage()),
                stop_reason: Some(StopReason::Stop),
            })),
        ];
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// A pre-scripted mock.  Each `call` pops the next item script off the
/// queue, so tests can specify exact stream sequences — including tool
/// calls, thinking and errors — without network access.
pub struct ScriptedMockClient {
    scripts: Arc<Mutex<Vec<Vec<LLMStreamItem>>>>,
    /// Pause inserted before every item; lets interrupt tests land a cancel
    /// mid-stream deterministically.
    item_delay: Option<Duration>,
    /// When set, `call` returns a stream that never yields — used to
    /// exercise the first-token timeout.
    never_yields: bool,
    /// The last parameter seen, for request-shape assertions.
    pub last_param: Arc<Mutex<Option<LLMCallParameter>>>,
    /// Number of `call` invocations so far.
    pub calls: Arc<Mutex<u32>>,
}

impl ScriptedMockClient {
    pub fn new(scripts: Vec<Vec<LLMStreamItem>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            item_delay: None,
            never_yields: false,
            last_param: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    /// A stream that stays silent forever.
    pub fn never_yields() -> Self {
        let mut s = Self::new(vec![]);
        s.never_yields = true;
        s
    }

    /// The full item sequence for one plain text response.
    pub fn text_response(text: impl Into<String>) -> Vec<LLMStreamItem> {
        let text = text.into();
        vec![
            LLMStreamItem::TextDelta {
                response_id: Some("r1".into()),
                content: text.clone(),
            },
            LLMStreamItem::Metadata(ResponseMetadataItem {
                response_id: Some("r1".into()),
                provider: "mock".into(),
                model_name: "scripted-mock-model".into(),
                usage: mock_usage(),
            }),
            LLMStreamItem::Completed(AssistantMessage {
                parts: vec![Part::text(text)],
                response_id: Some("r1".into()),
                usage: Some(mock_usage()),
                stop_reason: Some(StopReason::Stop),
            }),
        ]
    }

    /// The full item sequence for one response consisting of tool calls.
    pub fn tool_call_response(calls: &[(&str, &str, &str)]) -> Vec<LLMStreamItem> {
        let mut items: Vec<LLMStreamItem> = calls
            .iter()
            .map(|(id, name, _)| LLMStreamItem::ToolCallStart {
                response_id: Some("r1".into()),
                call_id: (*id).into(),
                name: (*name).into(),
            })
            .collect();
        items.push(LLMStreamItem::Metadata(ResponseMetadataItem {
            response_id: Some("r1".into()),
            provider: "mock".into(),
            model_name: "scripted-mock-model".into(),
            usage: mock_usage(),
        }));
        items.push(LLMStreamItem::Completed(AssistantMessage {
            parts: calls
                .iter()
                .map(|(id, name, args)| Part::tool_call(*id, *name, *args))
                .collect(),
            response_id: Some("r1".into()),
            usage: Some(mock_usage()),
            stop_reason: Some(StopReason::ToolUse),
        }));
        items
    }

    /// Convenience: one response that always returns `reply`.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_response(reply)])
    }

    /// Convenience: a tool call round followed by a text reply round.
    pub fn tool_then_text(
        call_id: &str,
        tool_name: &str,
        args_json: &str,
        final_text: &str,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_response(&[(call_id, tool_name, args_json)]),
            Self::text_response(final_text),
        ])
    }
}

#[async_trait]
impl LLMClient for ScriptedMockClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        *self.last_param.lock().unwrap() = Some(param);
        *self.calls.lock().unwrap() += 1;

        if self.never_yields {
            return Ok(Box::pin(futures::stream::pending()));
        }

        let items = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Self::text_response("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let delay = self.item_delay;
        let stream = futures::stream::iter(items.into_iter().map(Ok)).then(move |item| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::UserMessage;

    fn param(text: &str) -> LLMCallParameter {
        LLMCallParameter {
            messages: vec![HistoryEvent::User(UserMessage::from_text(text))],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let c = MockClient;
        let mut stream = c.call(param("hi")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            LLMStreamItem::TextDelta { content, .. } => assert!(content.contains("MOCK: hi")),
            other => panic!("unexpected first item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_ends_with_completed() {
        let c = ScriptedMockClient::always_text("done");
        let mut stream = c.call(param("x")).await.unwrap();
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item.unwrap());
        }
        assert!(matches!(last, Some(LLMStreamItem::Completed(_))));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let c = ScriptedMockClient::tool_then_text("c1", "Bash", "{}", "after");
        let mut s1 = c.call(param("x")).await.unwrap();
        let mut saw_tool_call = false;
        while let Some(item) = s1.next().await {
            if let LLMStreamItem::Completed(m) = item.unwrap() {
                saw_tool_call = m.has_tool_calls();
            }
        }
        assert!(saw_tool_call);

        let mut s2 = c.call(param("x")).await.unwrap();
        let mut text = String::new();
        while let Some(item) = s2.next().await {
            if let LLMStreamItem::Completed(m) = item.unwrap() {
                text = m.text();
            }
        }
        assert_eq!(text, "after");
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back() {
        let c = ScriptedMockClient::new(vec![]);
        let mut stream = c.call(param("x")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(
            first,
            LLMStreamItem::TextDelta { content, .. } if content.contains("no more scripts")
        ));
    }

    #[tokio::test]
    async fn last_param_captures_request() {
        let c = ScriptedMockClient::always_text("ok");
        let _ = c.call(param("captured")).await.unwrap();
        let last = c.last_param.lock().unwrap();
        let msgs = &last.as_ref().unwrap().messages;
        assert!(matches!(&msgs[0], HistoryEvent::User(m) if m.text() == "captured"));
    }
}
