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
use crate::openai_chat::build_chat_messages;

/// OpenRouter adapter: the chat-completions wire format plus ordered
/// `reasoning_details`.  Reasoning text, summaries and signatures arrive as
/// typed detail items and must be replayed in the same order on the next
/// request, or signature verification fails for Claude-family models.
pub struct OpenRouterClient {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    thinking_enabled: bool,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn from_config(cfg: &LLMConfig) -> Self {
        Self {
            model: cfg.model_name.clone(),
            api_key: cfg
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok()),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            thinking_enabled: cfg.thinking.as_ref().is_some_and(|t| t.enabled),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, param: &LLMCallParameter) -> Value {
        let wire = to_wire_messages(&param.messages);
        let mut messages = Vec::new();
        if let Some(system) = &param.system_prompt {
            if !system.is_empty() {
                messages.push(json!({ "role": "system", "content": system }));
            }
        }
        // Base chat conversion, then overlay reasoning_details on assistant
        // turns that carry thinking parts.
        let base = build_chat_messages(&wire);
        let mut wire_assistants = wire.iter().filter_map(|m| match m {
            WireMessage::Assistant(a) => Some(a),
            _ => None,
        });
        for mut msg in base {
            if msg["role"] == "assistant" {
                if let Some(assistant) = wire_assistants.next() {
                    let details = reasoning_details_for(assistant);
                    if !details.is_empty() {
                        msg["reasoning_details"] = json!(details);
                    }
                }
            }
            messages.push(msg);
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "usage": { "include": true },
        });
        if let Some(mt) = self.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if self.thinking_enabled {
            body["reasoning"] = json!({ "enabled": true });
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
        // Stable cache key so provider-side prompt caches survive across
        // requests of the same session.
        if let Some(sid) = &param.session_id {
            body["prompt_cache_key"] = json!(sid);
        }
        body
    }
}

/// Replay thinking parts as ordered reasoning_details.  A signature directly
/// following reasoning text attaches to that detail (Claude style); a
/// standalone signature becomes a `reasoning.encrypted` detail (OpenAI
/// style).
fn reasoning_details_for(assistant: &AssistantMessage) -> Vec<Value> {
    let mut details: Vec<Value> = Vec::new();
    for part in &assistant.parts {
        match part {
            Part::ThinkingText { text } => {
                let index = details.len();
                details.push(json!({
                    "type": "reasoning.text",
                    "text": text,
                    "index": index,
                }));
            }
            Part::ThinkingSignature { signature, format } => {
                match details.last_mut() {
                    Some(last) if last["type"] == "reasoning.text" => {
                        last["signature"] = json!(signature);
                    }
                    _ => {
                        let index = details.len();
                        details.push(json!({
                            "type": "reasoning.encrypted",
                            "data": signature,
                            "format": format,
                            "index": index,
                        }));
                    }
                }
            }
            _ => {}
        }
    }
    details
}

#[async_trait]
impl LLMClient for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        let key = self
            .api_key
            .as_deref()
            .context("OPENROUTER_API_KEY not set")?;
        let body = self.build_body(&param);
        debug!(model = %self.model, "sending openrouter request");

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("OpenRouter request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenRouter error {status}: {text}");
        }

        let model = self.model.clone();
        let (tx, rx) = mpsc::channel::<anyhow::Result<LLMStreamItem>>(64);
        tokio::spawn(async move {
            let _ = drive_stream(resp, model, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn drive_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<anyhow::Result<LLMStreamItem>>,
) -> Result<(), ()> {
    let started = Instant::now();
    let mut first_token_at: Option<Instant> = None;

    let mut response_id: Option<String> = None;
    let mut text = String::new();
    // Ordered (text, signature) reasoning details plus standalone encrypted
    // blobs, preserved in arrival order.
    let mut reasoning_parts: Vec<Part> = Vec::new();
    let mut accum = ToolCallAccumulator::new();
    let mut usage = Usage::default();
    let mut finish_reason: Option<String> = None;

    let mut byte_stream = resp.bytes_stream();
    let mut buf = String::new();
    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk_text = match chunk {
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(e) => {
                let _ = tx.send(Err(anyhow::anyhow!(e).context("openrouter stream"))).await;
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
            if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                usage.input_tokens = u["prompt_tokens"].as_u64().unwrap_or(0);
                usage.output_tokens = u["completion_tokens"].as_u64().unwrap_or(0);
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

            if let Some(details) = delta["reasoning_details"].as_array() {
                for detail in details {
                    match detail["type"].as_str().unwrap_or("") {
                        "reasoning.text" | "reasoning.summary" => {
                            let t = detail["text"]
                                .as_str()
                                .or_else(|| detail["summary"].as_str())
                                .unwrap_or("");
                            if !t.is_empty() {
                                reasoning_parts.push(Part::ThinkingText { text: t.into() });
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
                            if let Some(sig) = detail["signature"].as_str() {
                                reasoning_parts.push(Part::ThinkingSignature {
                                    signature: sig.into(),
                                    format: detail["format"].as_str().map(str::to_string),
                                });
                            }
                        }
                        "reasoning.encrypted" => {
                            if let Some(data) = detail["data"].as_str() {
                                reasoning_parts.push(Part::ThinkingSignature {
                                    signature: data.into(),
                                    format: detail["format"].as_str().map(str::to_string),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            } else if let Some(t) = delta["reasoning"].as_str() {
                // Providers without detail typing stream plain reasoning.
                if !t.is_empty() {
                    reasoning_parts.push(Part::ThinkingText { text: t.into() });
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

    // Coalesce consecutive thinking-text parts so replays stay compact while
    // text/signature ordering is preserved.
    let mut parts: Vec<Part> = Vec::new();
    for part in reasoning_parts {
        match (&part, parts.last_mut()) {
            (Part::ThinkingText { text: t }, Some(Part::ThinkingText { text: prev })) => {
                prev.push_str(t);
            }
            _ => parts.push(part),
        }
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
            provider: "openrouter".into(),
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

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_attaches_to_preceding_text_detail() {
        let assistant = AssistantMessage {
            parts: vec![
                Part::ThinkingText { text: "why".into() },
                Part::ThinkingSignature {
                    signature: "sig".into(),
                    format: Some("anthropic".into()),
                },
            ],
            ..Default::default()
        };
        let details = reasoning_details_for(&assistant);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0]["type"], "reasoning.text");
        assert_eq!(details[0]["signature"], "sig");
    }

    #[test]
    fn standalone_signature_becomes_encrypted_detail() {
        let assistant = AssistantMessage {
            parts: vec![Part::ThinkingSignature {
                signature: "blob".into(),
                format: Some("openai-responses-v1".into()),
            }],
            ..Default::default()
        };
        let details = reasoning_details_for(&assistant);
        assert_eq!(details[0]["type"], "reasoning.encrypted");
        assert_eq!(details[0]["data"], "blob");
    }

    #[test]
    fn details_keep_streamed_order() {
        let assistant = AssistantMessage {
            parts: vec![
                Part::ThinkingText { text: "a".into() },
                Part::ThinkingText { text: "b".into() },
            ],
            ..Default::default()
        };
        let details = reasoning_details_for(&assistant);
        assert_eq!(details[0]["index"], 0);
        assert_eq!(details[1]["index"], 1);
        assert_eq!(details[0]["text"], "a");
        assert_eq!(details[1]["text"], "b");
    }
}
