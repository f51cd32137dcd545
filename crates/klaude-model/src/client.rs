// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use klaude_protocol::{LLMCallParameter, LLMStreamItem};

pub type LLMStream = Pin<Box<dyn Stream<Item = anyhow::Result<LLMStreamItem>> + Send>>;

/// One model binding.  Implementations are cheap to share (`Arc`); concurrent
/// sub-agents bound to the same model share the client and its HTTP
/// connection pool.
///
/// Contract (spec'd in the turn executor's terms):
/// - exactly one [`LLMStreamItem::Completed`] per response id, after all
///   deltas for that id;
/// - tool calls are never reordered relative to their streamed index;
/// - dropping the stream closes the underlying HTTP stream promptly.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Provider name for status display and metadata ("anthropic", "mock" …).
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn call(&self, param: LLMCallParameter) -> anyhow::Result<LLMStream>;
}
