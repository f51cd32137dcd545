// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use klaude_protocol::SubAgentType;

/// Build the main agent's system prompt.
pub fn system_prompt(workdir: &Path, model_name: &str) -> String {
    format!(
        "You are an interactive coding agent running in a terminal. Help the \
         user with software engineering tasks: read and edit files, run \
         commands, search the codebase, and answer questions about it.\n\
         \n\
         Working directory: {}\n\
         Model: {}\n\
         \n\
         Guidelines:\n\
         - Prefer tools over guessing: read files before editing them, run \
         commands to verify behaviour.\n\
         - Keep answers concise; the user is reading a terminal.\n\
         - Use TodoWrite to plan multi-step work and keep it current.\n\
         - Never invent file contents or command output.\n\
         - When a task is genuinely ambiguous, use AskUserQuestion rather \
         than picking silently.",
        workdir.display(),
        model_name,
    )
}

/// System prompt for a sub-agent of the given kind.
pub fn sub_agent_prompt(kind: SubAgentType, workdir: &Path) -> String {
    let role = match kind {
        SubAgentType::Task => {
            "You are a sub-agent handling one delegated task autonomously. \
             You cannot ask the caller questions; your final message is your \
             only report back. Be thorough, then summarise what you did and \
             found."
        }
        SubAgentType::Explore => {
            "You are a read-only exploration sub-agent. Search and read the \
             codebase to answer the question you were given. Do not modify \
             any files. Report file paths and line references."
        }
        SubAgentType::Oracle => {
            "You are a reasoning sub-agent consulted for a hard question. \
             Read whatever context you need, think carefully, and return a \
             precise, well-argued answer."
        }
    };
    format!("{role}\n\nWorking directory: {}", workdir.display())
}

/// Appended to a sub-agent prompt when the caller requested structured
/// output via an `output_format` schema.
pub const REPORT_BACK_INSTRUCTION: &str = "\
When you have finished, end by calling the ReportBack tool exactly once \
with your result in the requested format. Text output alone will not be \
seen by the caller.";

/// Prompt used to summarise the history prefix during compaction.
pub const COMPACTION_PROMPT: &str = "\
You are compacting the context of a coding-agent session. Summarise the \
conversation below into a dense state checkpoint that lets the agent \
continue seamlessly. Preserve: the active task and its state, key \
technical decisions, every file that was read or modified (with paths), \
constraints and user preferences, and unfinished work. Quote exact names, \
paths, error messages and commands where they matter. Do not add \
commentary about the summarisation itself.";

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn system_prompt_mentions_workdir_and_model() {
        let p = system_prompt(&PathBuf::from("/work/proj"), "claude-sonnet-4-5");
        assert!(p.contains("/work/proj"));
        assert!(p.contains("claude-sonnet-4-5"));
    }

    #[test]
    fn explore_prompt_is_read_only() {
        let p = sub_agent_prompt(SubAgentType::Explore, &PathBuf::from("/w"));
        assert!(p.contains("Do not modify"));
    }
}
