// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Protocol types for the klaude execution engine.
//!
//! History is persisted as [`HistoryEvent`] (messages plus error / metadata /
//! checkpoint records).  Streaming-only items ([`LLMStreamItem`] deltas) are
//! emitted at runtime but never persisted.  The UI talks to the engine with
//! [`Operation`]s and listens to [`Event`]s; both are JSON-serialisable
//! tagged unions so frontends in other processes can speak them verbatim.

mod events;
mod llm;
mod message;
mod meta;
mod op;
mod user_interaction;

pub use events::{Event, EventPayload};
pub use llm::{
    LLMCallParameter, LLMConfig, LLMProtocol, LLMStreamItem, ResponseMetadataItem, ThinkingConfig,
    ThinkingEffort, ToolSchema,
};
pub use message::{
    AssistantMessage, AtFileResult, CheckpointEntry, CompactionEntry, DeveloperMessage,
    DeveloperUIExtra, HistoryEvent, InterruptEntry, Part, StopReason, StreamErrorItem,
    SystemMessage, ToolResultMessage, ToolStatus, UserInputPayload, UserMessage,
};
pub use meta::{
    SubAgentType, TaskMetadata, TaskMetadataItem, TodoItem, TodoStatus, ToolResultUIExtra, Usage,
};
pub use op::{Operation, Submission};
pub use user_interaction::{
    Question, QuestionOption, UserInteractionRequestPayload, UserInteractionResponse,
    UserInteractionSource, UserInteractionStatus,
};
