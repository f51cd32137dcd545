// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use klaude_protocol::{LLMConfig, LLMProtocol};

use crate::{
    AnthropicClient, LLMClient, MockClient, OpenAIChatClient, OpenRouterClient, ResponsesClient,
};

/// Construct a client for a model binding, keyed by protocol tag.
///
/// Provider-specific bindings that share a wire format (Bedrock, Vertex,
/// Codex, Copilot) are expressed as `base_url`/`provider_name` configuration
/// of the anthropic or openai codecs rather than as separate adapters.
pub fn create_client(cfg: &LLMConfig) -> Arc<dyn LLMClient> {
    match cfg.protocol {
        LLMProtocol::Anthropic => Arc::new(AnthropicClient::from_config(cfg)),
        LLMProtocol::OpenaiChat => Arc::new(OpenAIChatClient::from_config(cfg)),
        LLMProtocol::Responses => Arc::new(ResponsesClient::from_config(cfg)),
        LLMProtocol::Openrouter => Arc::new(OpenRouterClient::from_config(cfg)),
        LLMProtocol::Mock => Arc::new(MockClient),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_selects_adapter() {
        let mk = |protocol| LLMConfig {
            protocol,
            model_name: "m".into(),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            context_limit: None,
            thinking: None,
            provider_name: None,
        };
        assert_eq!(create_client(&mk(LLMProtocol::Anthropic)).name(), "anthropic");
        assert_eq!(create_client(&mk(LLMProtocol::OpenaiChat)).name(), "openai");
        assert_eq!(create_client(&mk(LLMProtocol::Responses)).name(), "openai");
        assert_eq!(create_client(&mk(LLMProtocol::Openrouter)).name(), "openrouter");
        assert_eq!(create_client(&mk(LLMProtocol::Mock)).name(), "mock");
    }

    #[test]
    fn provider_name_override_is_honoured() {
        let cfg = LLMConfig {
            protocol: LLMProtocol::Anthropic,
            model_name: "m".into(),
            api_key: None,
            base_url: Some("https://bedrock.example".into()),
            max_tokens: None,
            temperature: None,
            context_limit: None,
            thinking: None,
            provider_name: Some("bedrock".into()),
        };
        assert_eq!(create_client(&cfg).name(), "bedrock");
    }
}
