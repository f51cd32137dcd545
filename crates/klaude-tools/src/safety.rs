// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

/// Outcome of evaluating a shell command against the allow/deny lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyDecision {
    /// Matched an allow pattern.
    Allow,
    /// Matched neither list; the embedding application decides whether to
    /// confirm.  The engine itself runs these.
    Ask,
    /// Matched a deny pattern; never run.  Deny beats allow.
    Deny,
}

/// Allow/deny-list command evaluator exposed to the shell tool.
/// Patterns are simple shell globs (`*` matches anything, `?` one char).
#[derive(Debug, Default)]
pub struct CommandSafety {
    allow_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl CommandSafety {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            allow_patterns: compile(allow),
            deny_patterns: compile(deny),
        }
    }

    pub fn decide(&self, command: &str) -> SafetyDecision {
        for re in &self.deny_patterns {
            if re.is_match(command) {
                return SafetyDecision::Deny;
            }
        }
        for re in &self.allow_patterns {
            if re.is_match(command) {
                return SafetyDecision::Allow;
            }
        }
        SafetyDecision::Ask
    }
}

/// Convert a simple shell glob pattern to an anchored [`Regex`].
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
