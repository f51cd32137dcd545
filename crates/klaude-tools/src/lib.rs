// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod context;
mod offload;
mod registry;
mod safety;
mod tool;

pub use context::{
    InteractionRequester, SubAgentInvocation, SubAgentOutcome, SubTaskRunner, TodoHandle,
    ToolContext,
};
pub use offload::postprocess_output;
pub use registry::ToolRegistry;
pub use safety::{CommandSafety, SafetyDecision};
pub use tool::{ConcurrencyPolicy, OffloadStrategy, Tool, ToolOutput};

pub use builtin::ask_question::AskUserQuestionTool;
pub use builtin::edit_file::EditTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::read_file::ReadTool;
pub use builtin::shell::BashTool;
pub use builtin::todo_write::TodoWriteTool;
pub use builtin::update_memory::UpdateMemoryTool;
pub use builtin::write_file::WriteTool;
