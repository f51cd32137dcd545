// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming LLM protocol adapters.
//!
//! Every adapter implements one contract: `call(LLMCallParameter)` returns an
//! async stream of [`klaude_protocol::LLMStreamItem`]s.  Adapters own input
//! conversion (message grouping, developer-message attachment, thinking
//! signature handling), output accumulation (stable tool-call ordering by
//! streamed index) and latency measurement.  Backoff and retry live in the
//! turn executor, not here.

mod accum;
mod anthropic;
mod client;
mod input;
mod mock;
mod openai_chat;
mod openrouter;
mod registry;
mod responses;

pub use accum::ToolCallAccumulator;
pub use anthropic::AnthropicClient;
pub use client::{LLMClient, LLMStream};
pub use input::{to_wire_messages, WireMessage};
pub use mock::{MockClient, ScriptedMockClient};
pub use openai_chat::OpenAIChatClient;
pub use openrouter::OpenRouterClient;
pub use registry::create_client;
pub use responses::ResponsesClient;
