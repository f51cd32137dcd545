// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use klaude_protocol::{
    AssistantMessage, LLMCallParameter, LLMConfig, LLMStreamItem, Part, ResponseMetadataItem,
    StopReason, Usage,
};

use crate::accum::ToolCallAccumulator;
use crate::client::{LLMClient, LLMStream};
use crate::input::{to_wire_messages, WireMessage};

/// OpenAI-compatible chat-completions adapter.  Serves OpenAI itself plus
/// the long tail of compatible servers (llama.cpp, Ollama, vLLM, GLM,
/// deepseek); unsigned `reasoning_content` thinking is folded into thinking
/// parts.
pub struct OpenAIChatClient {
    model: String,
    provider: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAIChatClient {
    pub fn from_config(cfg: &LLMConfig) -> Self {
        Self {
            model: cfg.model_name.clone(),
            provider: cfg.provider_name.clone().unwrap_or_else(|| "openai".into()),
            api_key: cfg
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, param: &LLMCallParameter) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &param.system_prompt {
            if !system.is_empty() {
                messages.push(json!({ "role": "system", "content": system }));
            }
        }
        messages.extend(build_chat_messages(&to_wire_messages(&param.messages)));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(mt) = self.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if !param.tools.is_empty() {
            let tools: Vec<Value> = param
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl LLMClient for OpenAIChatClient {
    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        let body = self.build_body(&param);
        debug!(model = %self.model, tools = param.tools.len(), "sending chat completions request");

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("chat completions request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("chat completions error {status}: {text}");
        }

        let provider = self.provider.clone();
        let model = self.model.clone();
        let (tx, rx) = mpsc::channel::<anyhow::Result<LLMStreamItem>>(64);
        tokio::spawn(async move {
            let _ = drive_stream(resp, provider, model, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn drive_stream(
    resp: reqwest::Response,
    provider: String,
    model: String,
    tx: mpsc::Sender<anyhow::Result<LLMStreamItem>>,
) -> Result<(), ()> {
    let started = Instant::now();
    let mut first_token_at: Option<Instant> = None;

    let mut response_id: Option<String> = None;
    let mut text = String::new();
    let mut thinking = String::new();
    let mut accum = ToolCallAccumulator::new();
    let mut usage = Usage::default();
    let mut finish_reason: Option<String> = None;

    let mut byte_stream = resp.bytes_stream();
    let mut buf = String::new();
    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk_text = match chunk {
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(e) => {
                let _ = tx
                    .send(Err(anyhow::anyhow!(e).context("chat completions stream")))
                    .await;
                return Err(());
            }
        };
        buf.push_str(&chunk_text);
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break 'outer;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if first_token_at.is_none() {
                first_token_at = Some(Instant::now());
            }
            if response_id.is_none() {
                response_id = v["id"].as_str().map(str::to_string);
            }

            // The final usage-only chunk has an empty choices array.
            if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                usage.input_tokens = u["prompt_tokens"].as_u64().unwrap_or(0);
                usage.output_tokens = u["completion_tokens"].as_u64().unwrap_or(0);
                usage.cache_read_tokens = u["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0);
                usage.reasoning_tokens = u["completion_tokens_details"]["reasoning_tokens"]
                    .as_u64()
                    .unwrap_or(0);
            }
            let Some(choice) = v["choices"].get(0) else {
                continue;
            };
            if let Some(reason) = choice["finish_reason"].as_str() {
                finish_reason = Some(reason.to_string());
            }
            let delta = &choice["delta"];

            if let Some(t) = delta["reasoning_content"].as_str() {
                if !t.is_empty() {
                    thinking.push_str(t);
                    if tx
                        .send(Ok(LLMStreamItem::ThinkingDelta {
                            response_id: response_id.clone(),
                            content: t.to_string(),
                        }))
                        .await
                        .is_err()
                    {
                        return Err(());
                    }
                }
            }
            if let Some(t) = delta["content"].as_str() {
                if !t.is_empty() {
                    text.push_str(t);
                    if tx
                        .send(Ok(LLMStreamItem::TextDelta {
                            response_id: response_id.clone(),
                            content: t.to_string(),
                        }))
                        .await
                        .is_err()
                    {
                        return Err(());
                    }
                }
            }
            if let Some(tool_calls) = delta["tool_calls"].as_array() {
                for tc in tool_calls {
                    let index = tc["index"].as_u64().unwrap_or(0) as u32;
                    let id = tc["id"].as_str().unwrap_or("");
                    let name = tc["function"]["name"].as_str().unwrap_or("");
                    let args = tc["function"]["arguments"].as_str().unwrap_or("");
                    if let Some((call_id, name)) = accum.push(index, id, name, args) {
                        if tx
                            .send(Ok(LLMStreamItem::ToolCallStart {
                                response_id: response_id.clone(),
                                call_id,
                                name,
                            }))
                            .await
                            .is_err()
                        {
                            return Err(());
                        }
                    }
                }
            }
        }
    }

    usage.first_token_latency_ms = first_token_at.map(|t| (t - started).as_millis() as u64);
    if let Some(first) = first_token_at {
        let secs = first.elapsed().as_secs_f64();
        if secs > 0.0 && usage.output_tokens > 0 {
            usage.throughput_tps = Some(usage.output_tokens as f64 / secs);
        }
    }

    let mut parts: Vec<Part> = Vec::new();
    if !thinking.is_empty() {
        // Unsigned thinking (GLM / deepseek style): no signature part.
        parts.push(Part::ThinkingText { text: thinking });
    }
    if !text.is_empty() {
        parts.push(Part::Text { text });
    }
    let tool_parts = accum.finish();
    let had_tool_calls = !tool_parts.is_empty();
    parts.extend(tool_parts);

    let stop_reason = match finish_reason.as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ if had_tool_calls => StopReason::ToolUse,
        _ => StopReason::Stop,
    };

    let _ = tx
        .send(Ok(LLMStreamItem::Metadata(ResponseMetadataItem {
            response_id: response_id.clone(),
            provider,
            model_name: model,
            usage: usage.clone(),
        })))
        .await;
    let _ = tx
        .send(Ok(LLMStreamItem::Completed(AssistantMessage {
            parts,
            response_id,
            usage: Some(usage),
            stop_reason: Some(stop_reason),
        })))
        .await;
    Ok(())
}

// ─── Input conversion ─────────────────────────────────────────────────────────

fn user_content(parts: &[Part]) -> Value {
    let only_text = parts.iter().all(|p| matches!(p, Part::Text { .. }));
    if only_text {
        return json!(parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n"));
    }
    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(json!({ "type": "text", "text": text })),
            Part::ImageUrl { url } => {
                Some(json!({ "type": "image_url", "image_url": { "url": url } }))
            }
            _ => None,
        })
        .collect();
    json!(blocks)
}

/// Convert wire messages into the chat-completions `messages` array.
/// Consecutive assistant tool calls fold into one assistant message with a
/// `tool_calls` array (the parallel-tool-call wire format).
pub(crate) fn build_chat_messages(wire: &[WireMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    for msg in wire {
        match msg {
            WireMessage::System { text } => {
                out.push(json!({ "role": "system", "content": text }));
            }
            WireMessage::User { parts } => {
                out.push(json!({ "role": "user", "content": user_content(parts) }));
            }
            WireMessage::Assistant(m) => {
                let text = m.text();
                let tool_calls: Vec<Value> = m
                    .tool_calls()
                    .into_iter()
                    .map(|(id, name, args)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": args },
                        })
                    })
                    .collect();
                let mut obj = json!({
                    "role": "assistant",
                    "content": if text.is_empty() { Value::Null } else { json!(text) },
                });
                if !tool_calls.is_empty() {
                    obj["tool_calls"] = json!(tool_calls);
                }
                // Unsigned thinking is replayed only for servers that expect
                // it; harmless elsewhere (unknown fields are ignored).
                let thinking = m.thinking_text();
                if !thinking.is_empty() && tool_calls.is_empty() && text.is_empty() {
                    obj["reasoning_content"] = json!(thinking);
                }
                if !text.is_empty() || !tool_calls.is_empty() || obj.get("reasoning_content").is_some() {
                    out.push(obj);
                }
            }
            WireMessage::ToolResult { message, attached } => {
                let mut content = message.output_text.clone();
                let attached_text: String = attached
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if !attached_text.is_empty() {
                    content.push('\n');
                    content.push_str(&attached_text);
                }
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": message.call_id,
                    "content": content,
                }));
                // The chat API cannot carry images in tool results; follow
                // with a user turn holding them.
                let images: Vec<&Part> = message
                    .parts
                    .iter()
                    .filter(|p| matches!(p, Part::ImageUrl { .. } | Part::ImageFile { .. }))
                    .collect();
                if !images.is_empty() {
                    let blocks: Vec<Value> = images
                        .iter()
                        .filter_map(|p| match p {
                            Part::ImageUrl { url } => Some(
                                json!({ "type": "image_url", "image_url": { "url": url } }),
                            ),
                            _ => None,
                        })
                        .collect();
                    if !blocks.is_empty() {
                        out.push(json!({ "role": "user", "content": blocks }));
                    }
                }
            }
        }
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::{HistoryEvent, ToolResultMessage, ToolStatus, UserMessage};

    fn wire(events: &[HistoryEvent]) -> Vec<Value> {
        build_chat_messages(&to_wire_messages(events))
    }

    #[test]
    fn plain_user_message_is_a_string() {
        let msgs = wire(&[HistoryEvent::User(UserMessage::from_text("hi"))]);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"], "hi");
    }

    #[test]
    fn user_with_image_becomes_block_array() {
        let mut m = UserMessage::from_text("look");
        m.parts.push(Part::image_url("data:image/png;base64,AA"));
        let msgs = wire(&[HistoryEvent::User(m)]);
        assert!(msgs[0]["content"].is_array());
        assert_eq!(msgs[0]["content"][1]["type"], "image_url");
    }

    #[test]
    fn assistant_tool_calls_fold_into_array() {
        let msgs = wire(&[HistoryEvent::Assistant(AssistantMessage {
            parts: vec![
                Part::tool_call("c1", "Bash", "{}"),
                Part::tool_call("c2", "Read", "{}"),
            ],
            ..Default::default()
        })]);
        assert_eq!(msgs.len(), 1);
        let calls = msgs[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "c1");
        assert_eq!(calls[1]["id"], "c2");
        assert_eq!(msgs[0]["content"], Value::Null);
    }

    #[test]
    fn tool_result_maps_to_tool_role() {
        let msgs = wire(&[HistoryEvent::ToolResult(ToolResultMessage {
            call_id: "c1".into(),
            tool_name: "Bash".into(),
            status: ToolStatus::Success,
            output_text: "hi\n".into(),
            parts: vec![],
            ui_extra: None,
            task_metadata: None,
        })]);
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "c1");
        assert_eq!(msgs[0]["content"], "hi\n");
    }

    #[test]
    fn body_advertises_tools_and_usage_option() {
        let client = OpenAIChatClient::from_config(&LLMConfig {
            protocol: klaude_protocol::LLMProtocol::OpenaiChat,
            model_name: "gpt-4o".into(),
            api_key: Some("k".into()),
            base_url: None,
            max_tokens: Some(1024),
            temperature: None,
            context_limit: None,
            thinking: None,
            provider_name: None,
        });
        let body = client.build_body(&LLMCallParameter {
            messages: vec![HistoryEvent::User(UserMessage::from_text("x"))],
            system_prompt: Some("sys".into()),
            tools: vec![klaude_protocol::ToolSchema {
                name: "Bash".into(),
                description: "run".into(),
                parameters: json!({ "type": "object" }),
            }],
            session_id: None,
        });
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "Bash");
        assert_eq!(body["messages"][0]["role"], "system");
    }
}
