// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use klaude_protocol::{
    AssistantMessage, LLMCallParameter, LLMConfig, LLMStreamItem, Part, ResponseMetadataItem,
    StopReason, ToolStatus, Usage,
};

use crate::client::{LLMClient, LLMStream};
use crate::input::{to_wire_messages, WireMessage};

/// Anthropic Messages API adapter (also used by Bedrock/Vertex bindings via
/// `base_url` + header overrides).
pub struct AnthropicClient {
    model: String,
    provider: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
    thinking: Option<klaude_protocol::ThinkingConfig>,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn from_config(cfg: &LLMConfig) -> Self {
        Self {
            model: cfg.model_name.clone(),
            provider: cfg
                .provider_name
                .clone()
                .unwrap_or_else(|| "anthropic".into()),
            api_key: cfg
                .api_key
                .clone()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: cfg.max_tokens.unwrap_or(8192),
            temperature: cfg.temperature,
            thinking: cfg.thinking.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, param: &LLMCallParameter) -> Value {
        let messages = build_messages(&to_wire_messages(&param.messages));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        // System prompt as a block array with cache_control so the stable
        // prefix is cached across turns.
        if let Some(system) = &param.system_prompt {
            if !system.is_empty() {
                body["system"] = json!([{
                    "type": "text",
                    "text": system,
                    "cache_control": { "type": "ephemeral" },
                }]);
            }
        }
        if !param.tools.is_empty() {
            let tools: Vec<Value> = param
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(thinking) = &self.thinking {
            if thinking.enabled {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": thinking.budget_tokens.unwrap_or(4096),
                });
            }
        }
        body
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;
        let body = self.build_body(&param);
        debug!(model = %self.model, tools = param.tools.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        let provider = self.provider.clone();
        let model = self.model.clone();
        let (tx, rx) = mpsc::channel::<anyhow::Result<LLMStreamItem>>(64);
        tokio::spawn(async move {
            // If the consumer drops the receiver, sends fail and the task
            // returns, dropping the HTTP stream promptly.
            let _ = drive_stream(resp, provider, model, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Per-index content-block accumulation state.
enum Block {
    Text(String),
    Thinking { text: String, signature: String },
    ToolUse { id: String, name: String, args: String },
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
    let mut blocks: BTreeMap<u64, Block> = BTreeMap::new();
    let mut usage = Usage::default();
    let mut stop_reason = StopReason::Stop;
    let mut done = false;

    let mut byte_stream = resp.bytes_stream();
    // SSE lines can be split across TCP chunks; carry the remainder forward
    // and only parse complete lines.
    let mut buf = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let text = match chunk {
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(e) => {
                let _ = tx.send(Err(anyhow::anyhow!(e).context("anthropic stream"))).await;
                return Err(());
            }
        };
        buf.push_str(&text);
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if first_token_at.is_none() {
                first_token_at = Some(Instant::now());
            }

            match v["type"].as_str().unwrap_or("") {
                "message_start" => {
                    response_id = v["message"]["id"].as_str().map(str::to_string);
                    if let Some(u) = v["message"].get("usage") {
                        usage.input_tokens = u["input_tokens"].as_u64().unwrap_or(0);
                        usage.cache_read_tokens =
                            u["cache_read_input_tokens"].as_u64().unwrap_or(0);
                        usage.cache_write_tokens =
                            u["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                    }
                }
                "content_block_start" => {
                    let index = v["index"].as_u64().unwrap_or(0);
                    let block = &v["content_block"];
                    match block["type"].as_str().unwrap_or("") {
                        "tool_use" => {
                            let id = block["id"].as_str().unwrap_or("").to_string();
                            let name = block["name"].as_str().unwrap_or("").to_string();
                            if tx
                                .send(Ok(LLMStreamItem::ToolCallStart {
                                    response_id: response_id.clone(),
                                    call_id: id.clone(),
                                    name: name.clone(),
                                }))
                                .await
                                .is_err()
                            {
                                return Err(());
                            }
                            blocks.insert(
                                index,
                                Block::ToolUse {
                                    id,
                                    name,
                                    args: String::new(),
                                },
                            );
                        }
                        "thinking" => {
                            blocks.insert(
                                index,
                                Block::Thinking {
                                    text: String::new(),
                                    signature: String::new(),
                                },
                            );
                        }
                        _ => {
                            blocks.insert(index, Block::Text(String::new()));
                        }
                    }
                }
                "content_block_delta" => {
                    let index = v["index"].as_u64().unwrap_or(0);
                    let delta = &v["delta"];
                    match delta["type"].as_str().unwrap_or("") {
                        "text_delta" => {
                            let t = delta["text"].as_str().unwrap_or("");
                            if !t.is_empty() {
                                match blocks
                                    .entry(index)
                                    .or_insert_with(|| Block::Text(String::new()))
                                {
                                    Block::Text(buf) => buf.push_str(t),
                                    _ => warn!(index, "text delta for non-text block"),
                                }
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
                        "thinking_delta" => {
                            let t = delta["thinking"].as_str().unwrap_or("");
                            if !t.is_empty() {
                                if let Some(Block::Thinking { text, .. }) = blocks.get_mut(&index)
                                {
                                    text.push_str(t);
                                }
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
                        // The signature blob is not human-readable; it is
                        // stored so the thinking block can be replayed on
                        // the next request, never surfaced as text.
                        "signature_delta" => {
                            let s = delta["signature"].as_str().unwrap_or("");
                            if let Some(Block::Thinking { signature, .. }) = blocks.get_mut(&index)
                            {
                                signature.push_str(s);
                            }
                        }
                        "input_json_delta" => {
                            let partial = delta["partial_json"].as_str().unwrap_or("");
                            if let Some(Block::ToolUse { args, .. }) = blocks.get_mut(&index) {
                                args.push_str(partial);
                            }
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                        stop_reason = match reason {
                            "tool_use" => StopReason::ToolUse,
                            "max_tokens" => StopReason::MaxTokens,
                            _ => StopReason::Stop,
                        };
                    }
                    if let Some(u) = v.get("usage") {
                        usage.output_tokens = u["output_tokens"].as_u64().unwrap_or(0);
                    }
                }
                "message_stop" => {
                    done = true;
                }
                "error" => {
                    let msg = v["error"]["message"].as_str().unwrap_or("unknown error");
                    let _ = tx
                        .send(Ok(LLMStreamItem::StreamError(
                            klaude_protocol::StreamErrorItem::new(format!(
                                "anthropic stream error: {msg}"
                            )),
                        )))
                        .await;
                    return Err(());
                }
                _ => {}
            }
        }
        if done {
            break;
        }
    }

    usage.first_token_latency_ms = first_token_at.map(|t| (t - started).as_millis() as u64);
    if let Some(first) = first_token_at {
        let secs = first.elapsed().as_secs_f64();
        if secs > 0.0 && usage.output_tokens > 0 {
            usage.throughput_tps = Some(usage.output_tokens as f64 / secs);
        }
    }

    // Assemble the final assistant message in block-index order.
    let mut parts: Vec<Part> = Vec::new();
    for (_, block) in blocks {
        match block {
            Block::Thinking { text, signature } => {
                if !text.is_empty() {
                    parts.push(Part::ThinkingText { text });
                }
                if !signature.is_empty() {
                    parts.push(Part::ThinkingSignature {
                        signature,
                        format: Some("anthropic".into()),
                    });
                }
            }
            Block::Text(text) => {
                if !text.is_empty() {
                    parts.push(Part::Text { text });
                }
            }
            Block::ToolUse { id, name, args } => {
                if name.is_empty() {
                    warn!(call_id = %id, "dropping tool use with empty name");
                    continue;
                }
                parts.push(Part::ToolCall {
                    call_id: id,
                    tool_name: name,
                    arguments_json: if args.trim().is_empty() {
                        "{}".into()
                    } else {
                        args
                    },
                });
            }
        }
    }

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

fn part_to_block(part: &Part) -> Option<Value> {
    match part {
        Part::Text { text } => Some(json!({ "type": "text", "text": text })),
        Part::ImageUrl { url } => Some(image_block(url)),
        Part::ImageFile { file_path, mime_type, .. } => {
            // Generated images are stored on disk; inline them on replay.
            match std::fs::read(file_path) {
                Ok(bytes) => {
                    use base64::Engine;
                    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                    Some(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": mime_type.clone().unwrap_or_else(|| "image/png".into()),
                            "data": b64,
                        }
                    }))
                }
                Err(_) => Some(json!({
                    "type": "text",
                    "text": format!("[image unavailable: {}]", file_path.display()),
                })),
            }
        }
        _ => None,
    }
}

fn image_block(url: &str) -> Value {
    // Data URLs become base64 sources; anything else is a remote reference.
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let mime = meta.strip_suffix(";base64").unwrap_or(meta);
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime, "data": data }
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

/// Convert wire messages into the Anthropic `messages` array, attaching
/// `cache_control` to the final content block of the most recent user or
/// tool message so conversation history caches incrementally.
fn build_messages(wire: &[WireMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    for msg in wire {
        match msg {
            // An explicit system override mid-history is folded into a user
            // turn; Anthropic accepts system text only at the top level.
            WireMessage::System { text } => {
                out.push(json!({ "role": "user", "content": [{ "type": "text", "text": text }] }));
            }
            WireMessage::User { parts } => {
                let content: Vec<Value> = parts.iter().filter_map(part_to_block).collect();
                if !content.is_empty() {
                    out.push(json!({ "role": "user", "content": content }));
                }
            }
            WireMessage::Assistant(m) => {
                let mut content: Vec<Value> = Vec::new();
                let mut pending_thinking: Option<(String, String)> = None;
                for part in &m.parts {
                    match part {
                        Part::ThinkingText { text } => {
                            pending_thinking = Some((text.clone(), String::new()));
                        }
                        Part::ThinkingSignature { signature, .. } => {
                            if let Some((text, _)) = pending_thinking.take() {
                                content.push(json!({
                                    "type": "thinking",
                                    "thinking": text,
                                    "signature": signature,
                                }));
                            }
                        }
                        Part::Text { text } => {
                            // Flush an unsigned thinking block before text;
                            // without a signature it cannot be replayed.
                            pending_thinking = None;
                            content.push(json!({ "type": "text", "text": text }));
                        }
                        Part::ToolCall {
                            call_id,
                            tool_name,
                            arguments_json,
                        } => {
                            pending_thinking = None;
                            // tool_use.id must match ^[a-zA-Z0-9_-]+$; an
                            // empty id would 400 the whole request.
                            let safe_id = if call_id.is_empty() {
                                "call_fallback".to_string()
                            } else {
                                call_id.clone()
                            };
                            content.push(json!({
                                "type": "tool_use",
                                "id": safe_id,
                                "name": tool_name,
                                "input": serde_json::from_str::<Value>(arguments_json)
                                    .unwrap_or_else(|_| json!({})),
                            }));
                        }
                        Part::ImageUrl { .. } | Part::ImageFile { .. } => {
                            if let Some(block) = part_to_block(part) {
                                content.push(block);
                            }
                        }
                    }
                }
                if !content.is_empty() {
                    out.push(json!({ "role": "assistant", "content": content }));
                }
            }
            WireMessage::ToolResult { message, attached } => {
                let mut content: Vec<Value> = vec![json!({
                    "type": "tool_result",
                    "tool_use_id": message.call_id,
                    "content": message.output_text,
                    "is_error": message.status != ToolStatus::Success,
                })];
                for part in message.parts.iter().chain(attached.iter()) {
                    if let Some(block) = part_to_block(part) {
                        content.push(block);
                    }
                }
                out.push(json!({ "role": "user", "content": content }));
            }
        }
    }

    // Cache breakpoint on the most recent user-role message.
    if let Some(last_user) = out
        .iter_mut()
        .rev()
        .find(|m| m["role"].as_str() == Some("user"))
    {
        if let Some(blocks) = last_user["content"].as_array_mut() {
            if let Some(last_block) = blocks.last_mut() {
                last_block["cache_control"] = json!({ "type": "ephemeral" });
            }
        }
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
