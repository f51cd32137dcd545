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
    StopReason, ThinkingEffort, Usage,
};

use crate::client::{LLMClient, LLMStream};
use crate::input::{to_wire_messages, WireMessage};

const SIGNATURE_FORMAT: &str = "openai-responses-v1";

/// OpenAI Responses API adapter.
///
/// Reasoning round-trips as encrypted content: the API returns reasoning
/// items with an `encrypted_content` blob which must be replayed verbatim in
/// the next request's input, paired with the summary text shown to the user.
pub struct ResponsesClient {
    model: String,
    provider: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: Option<u32>,
    effort: Option<ThinkingEffort>,
    client: reqwest::Client,
}

impl ResponsesClient {
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
            effort: cfg.thinking.as_ref().and_then(|t| t.effort),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, param: &LLMCallParameter) -> Value {
        let input = build_input_items(&to_wire_messages(&param.messages));
        let mut body = json!({
            "model": self.model,
            "input": input,
            "stream": true,
            "store": false,
            "include": ["reasoning.encrypted_content"],
        });
        if let Some(system) = &param.system_prompt {
            if !system.is_empty() {
                body["instructions"] = json!(system);
            }
        }
        if let Some(mt) = self.max_tokens {
            body["max_output_tokens"] = json!(mt);
        }
        if let Some(effort) = self.effort {
            let effort = match effort {
                ThinkingEffort::Low => "low",
                ThinkingEffort::Medium => "medium",
                ThinkingEffort::High => "high",
            };
            body["reasoning"] = json!({ "effort": effort, "summary": "auto" });
        }
        if !param.tools.is_empty() {
            let tools: Vec<Value> = param
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(sid) = &param.session_id {
            body["prompt_cache_key"] = json!(sid);
        }
        body
    }
}

#[async_trait]
impl LLMClient for ResponsesClient {
    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream> {
        let key = self.api_key.as_deref().context("OPENAI_API_KEY not set")?;
        let body = self.build_body(&param);
        debug!(model = %self.model, "sending responses request");

        let resp = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("Responses request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Responses error {status}: {text}");
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
    let mut completed: Option<Value> = None;

    let mut byte_stream = resp.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = byte_stream.next().await {
        let chunk_text = match chunk {
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(e) => {
                let _ = tx.send(Err(anyhow::anyhow!(e).context("responses stream"))).await;
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
            let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if first_token_at.is_none() {
                first_token_at = Some(Instant::now());
            }

            match v["type"].as_str().unwrap_or("") {
                "response.created" => {
                    response_id = v["response"]["id"].as_str().map(str::to_string);
                }
                "response.output_text.delta" => {
                    let t = v["delta"].as_str().unwrap_or("");
                    if !t.is_empty()
                        && tx
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
                "response.reasoning_summary_text.delta" => {
                    let t = v["delta"].as_str().unwrap_or("");
                    if !t.is_empty()
                        && tx
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
                "response.output_item.added" => {
                    let item = &v["item"];
                    if item["type"].as_str() == Some("function_call") {
                        let call_id = item["call_id"].as_str().unwrap_or("").to_string();
                        let name = item["name"].as_str().unwrap_or("").to_string();
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
                "response.failed" | "error" => {
                    let msg = v["response"]["error"]["message"]
                        .as_str()
                        .or_else(|| v["message"].as_str())
                        .unwrap_or("unknown error");
                    let _ = tx
                        .send(Ok(LLMStreamItem::StreamError(
                            klaude_protocol::StreamErrorItem::new(format!(
                                "responses stream error: {msg}"
                            )),
                        )))
                        .await;
                    return Err(());
                }
                "response.completed" => {
                    completed = Some(v["response"].clone());
                }
                _ => {}
            }
        }
        if completed.is_some() {
            break;
        }
    }

    // The completed payload carries the authoritative output items; the
    // deltas above were display-only.
    let Some(response) = completed else {
        let _ = tx
            .send(Ok(LLMStreamItem::StreamError(
                klaude_protocol::StreamErrorItem::new("responses stream ended without completion"),
            )))
            .await;
        return Err(());
    };

    let mut usage = Usage {
        input_tokens: response["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: response["usage"]["output_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: response["usage"]["input_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0),
        reasoning_tokens: response["usage"]["output_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0),
        ..Default::default()
    };
    usage.first_token_latency_ms = first_token_at.map(|t| (t - started).as_millis() as u64);
    if let Some(first) = first_token_at {
        let secs = first.elapsed().as_secs_f64();
        if secs > 0.0 && usage.output_tokens > 0 {
            usage.throughput_tps = Some(usage.output_tokens as f64 / secs);
        }
    }

    let mut parts: Vec<Part> = Vec::new();
    let mut had_tool_calls = false;
    if let Some(output) = response["output"].as_array() {
        for item in output {
            match item["type"].as_str().unwrap_or("") {
                "reasoning" => {
                    if let Some(summaries) = item["summary"].as_array() {
                        for s in summaries {
                            if let Some(t) = s["text"].as_str() {
                                if !t.is_empty() {
                                    parts.push(Part::ThinkingText { text: t.into() });
                                }
                            }
                        }
                    }
                    if let Some(enc) = item["encrypted_content"].as_str() {
                        parts.push(Part::ThinkingSignature {
                            signature: enc.into(),
                            format: Some(SIGNATURE_FORMAT.into()),
                        });
                    }
                }
                "message" => {
                    if let Some(content) = item["content"].as_array() {
                        for c in content {
                            if c["type"].as_str() == Some("output_text") {
                                if let Some(t) = c["text"].as_str() {
                                    if !t.is_empty() {
                                        parts.push(Part::Text { text: t.into() });
                                    }
                                }
                            }
                        }
                    }
                }
                "function_call" => {
                    had_tool_calls = true;
                    parts.push(Part::ToolCall {
                        call_id: item["call_id"].as_str().unwrap_or("").to_string(),
                        tool_name: item["name"].as_str().unwrap_or("").to_string(),
                        arguments_json: item["arguments"].as_str().unwrap_or("{}").to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    let stop_reason = match response["status"].as_str() {
        Some("incomplete") => StopReason::MaxTokens,
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

/// Convert wire messages into Responses input items.  Tool calls and their
/// outputs are top-level `function_call` / `function_call_output` items, and
/// encrypted reasoning replays as `reasoning` items ahead of the assistant
/// turn they belong to.
pub(crate) fn build_input_items(wire: &[WireMessage]) -> Vec<Value> {
    let mut items: Vec<Value> = Vec::new();

    for msg in wire {
        match msg {
            WireMessage::System { text } => {
                items.push(json!({
                    "type": "message",
                    "role": "system",
                    "content": [{ "type": "input_text", "text": text }],
                }));
            }
            WireMessage::User { parts } => {
                let content: Vec<Value> = parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => {
                            Some(json!({ "type": "input_text", "text": text }))
                        }
                        Part::ImageUrl { url } => {
                            Some(json!({ "type": "input_image", "image_url": url }))
                        }
                        _ => None,
                    })
                    .collect();
                if !content.is_empty() {
                    items.push(json!({
                        "type": "message",
                        "role": "user",
                        "content": content,
                    }));
                }
            }
            WireMessage::Assistant(m) => {
                // Reasoning first: encrypted content must precede the output
                // it justified.
                let mut pending_summary: Vec<Value> = Vec::new();
                for part in &m.parts {
                    match part {
                        Part::ThinkingText { text } => {
                            pending_summary.push(json!({ "type": "summary_text", "text": text }));
                        }
                        Part::ThinkingSignature { signature, format } => {
                            if format.as_deref() == Some(SIGNATURE_FORMAT) {
                                items.push(json!({
                                    "type": "reasoning",
                                    "summary": std::mem::take(&mut pending_summary),
                                    "encrypted_content": signature,
                                }));
                            } else {
                                pending_summary.clear();
                            }
                        }
                        _ => {}
                    }
                }
                let text = m.text();
                if !text.is_empty() {
                    items.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": [{ "type": "output_text", "text": text }],
                    }));
                }
                for (call_id, name, args) in m.tool_calls() {
                    items.push(json!({
                        "type": "function_call",
                        "call_id": call_id,
                        "name": name,
                        "arguments": args,
                    }));
                }
            }
            WireMessage::ToolResult { message, attached } => {
                let mut output = message.output_text.clone();
                let attached_text: String = attached
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if !attached_text.is_empty() {
                    output.push('\n');
                    output.push_str(&attached_text);
                }
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": message.call_id,
                    "output": output,
                }));
            }
        }
    }

    items
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
