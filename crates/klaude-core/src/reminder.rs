// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reminder pipeline: developer messages injected before every turn.
//!
//! Each reminder reads the session and may return one developer message;
//! none of them mutates the conversation — the task executor appends what
//! they return.  File observations go through the session's file tracker so
//! unchanged content is never re-emitted.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use klaude_config::ToolsSettings;
use klaude_protocol::{
    AtFileResult, DeveloperMessage, DeveloperUIExtra, HistoryEvent, Part, TodoStatus,
};
use klaude_session::Session;

const MEMORY_FILE_NAMES: &[&str] = &["AGENTS.md", "CLAUDE.md", "AGENT.md"];

pub struct ReminderPipeline {
    tools_cfg: ToolsSettings,
    /// Priority-ordered directories searched for memory files.
    memory_dirs: Vec<PathBuf>,
    /// Priority-ordered skill roots (each holds `<name>/SKILL.md`).
    skill_dirs: Vec<PathBuf>,
}

impl ReminderPipeline {
    /// Explicit search paths; used by tests and embedders that relocate the
    /// memory/skill roots.
    pub fn with_search_paths(
        tools_cfg: ToolsSettings,
        memory_dirs: Vec<PathBuf>,
        skill_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            tools_cfg,
            memory_dirs,
            skill_dirs,
        }
    }

    pub fn new(workdir: &Path, tools_cfg: ToolsSettings) -> Self {
        let mut memory_dirs = vec![workdir.to_path_buf()];
        let mut skill_dirs = vec![workdir.join(".klaude/skills")];
        if let Some(home) = dirs::home_dir() {
            memory_dirs.push(home.join(".klaude"));
            memory_dirs.push(home.clone());
            skill_dirs.push(home.join(".klaude/skills"));
        }
        Self {
            tools_cfg,
            memory_dirs,
            skill_dirs,
        }
    }

    /// Run every reminder in order.  `last_turn_touched_todos` comes from
    /// the task executor's todo handle and gates the staleness hint.
    pub fn run(&self, session: &Session, last_turn_touched_todos: bool) -> Vec<DeveloperMessage> {
        let mut out = Vec::new();
        out.extend(self.memory_discovery(session));
        out.extend(self.at_file_resolver(session));
        out.extend(self.external_file_changes(session));
        out.extend(self.todo_staleness(session, last_turn_touched_todos));
        out.extend(self.skill_activation(session));
        out
    }

    // ── Memory discovery ─────────────────────────────────────────────────────

    /// One memory file per directory (first matching well-known name),
    /// emitted when new or changed since the last emission.
    fn memory_discovery(&self, session: &Session) -> Option<DeveloperMessage> {
        let mut sections = Vec::new();
        let mut paths = Vec::new();

        for dir in &self.memory_dirs {
            let Some(path) = MEMORY_FILE_NAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.is_file())
            else {
                continue;
            };
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let unchanged = session
                .file_tracker
                .get(&path)
                .map(|r| r.sha256 == klaude_session::FileTracker::sha256_hex(&bytes))
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            session.file_tracker.record(&path, &bytes, true);
            debug!(path = %path.display(), "memory file loaded");
            sections.push(format!(
                "Contents of {}:\n\n{}",
                path.display(),
                String::from_utf8_lossy(&bytes)
            ));
            paths.push(path);
        }

        if sections.is_empty() {
            return None;
        }
        Some(DeveloperMessage {
            parts: vec![Part::text(format!(
                "<system-reminder>\n{}\n</system-reminder>",
                sections.join("\n\n")
            ))],
            ui_extra: Some(DeveloperUIExtra {
                memory_paths: Some(paths),
                ..Default::default()
            }),
        })
    }

    // ── @-file resolver ──────────────────────────────────────────────────────

    /// Resolve `@path` and `@"path with spaces"` mentions in the latest user
    /// message and attach the file contents (bounded).
    fn at_file_resolver(&self, session: &Session) -> Option<DeveloperMessage> {
        let text = last_user_text(session)?;
        let re = Regex::new(r#"@"([^"]+)"|@([\w~][\w./~-]*)"#).expect("static regex");

        let mut sections = Vec::new();
        let mut results = Vec::new();
        for cap in re.captures_iter(&text) {
            let raw = cap
                .get(1)
                .or_else(|| cap.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if raw.is_empty() {
                continue;
            }
            let path = if Path::new(raw).is_absolute() {
                PathBuf::from(raw)
            } else {
                session.workdir.join(raw)
            };
            if !path.is_file() {
                continue;
            }
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let truncated = bytes.len() > self.tools_cfg.at_file_max_bytes;
                    let shown = &bytes[..bytes.len().min(self.tools_cfg.at_file_max_bytes)];
                    session.file_tracker.record(&path, &bytes, false);
                    let mut body = String::from_utf8_lossy(shown).to_string();
                    if truncated {
                        body.push_str("\n[... file truncated ...]");
                    }
                    sections.push(format!("Contents of @{raw} ({}):\n\n{body}", path.display()));
                    results.push(AtFileResult {
                        pattern: format!("@{raw}"),
                        path,
                        loaded: true,
                        note: truncated.then(|| "truncated".to_string()),
                    });
                }
                Err(e) => {
                    results.push(AtFileResult {
                        pattern: format!("@{raw}"),
                        path,
                        loaded: false,
                        note: Some(e.to_string()),
                    });
                }
            }
        }

        if sections.is_empty() {
            return None;
        }
        Some(DeveloperMessage {
            parts: vec![Part::text(format!(
                "<system-reminder>\n{}\n</system-reminder>",
                sections.join("\n\n")
            ))],
            ui_extra: Some(DeveloperUIExtra {
                at_files: Some(results),
                ..Default::default()
            }),
        })
    }

    // ── External file changes ────────────────────────────────────────────────

    fn external_file_changes(&self, session: &Session) -> Option<DeveloperMessage> {
        let changed = session.file_tracker.changed_on_disk();
        if changed.is_empty() {
            return None;
        }
        // Re-record the current content so the reminder fires once per
        // external edit, not on every following turn.
        for path in &changed {
            if let Ok(bytes) = std::fs::read(path) {
                session.file_tracker.record(path, &bytes, false);
            }
        }
        let listing = changed
            .iter()
            .map(|p| format!("- {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Some(DeveloperMessage {
            parts: vec![Part::text(format!(
                "<system-reminder>\nThese files changed on disk outside this \
                 session since they were last read:\n{listing}\nRe-read them \
                 before relying on their contents.\n</system-reminder>"
            ))],
            ui_extra: Some(DeveloperUIExtra {
                external_file_changes: Some(changed),
                ..Default::default()
            }),
        })
    }

    // ── Todo staleness ───────────────────────────────────────────────────────

    fn todo_staleness(&self, session: &Session, touched: bool) -> Option<DeveloperMessage> {
        if touched {
            return None;
        }
        let incomplete = session
            .todos
            .iter()
            .filter(|t| t.status != TodoStatus::Completed)
            .count();
        if incomplete == 0 {
            return None;
        }
        // No hint before the agent produced anything — the list was only
        // just written.
        if !session
            .history
            .iter()
            .any(|e| matches!(e, HistoryEvent::Assistant(_)))
        {
            return None;
        }
        Some(DeveloperMessage {
            parts: vec![Part::text(format!(
                "<system-reminder>\nThe todo list has {incomplete} incomplete \
                 item(s) and was not updated in the last turn. Update it with \
                 TodoWrite as you make progress.\n</system-reminder>"
            ))],
            ui_extra: Some(DeveloperUIExtra {
                todo_hint: Some(true),
                ..Default::default()
            }),
        })
    }

    // ── Skill activation ─────────────────────────────────────────────────────

    /// `/skill:<name>` (or `//skill:<name>`) at the start of the user
    /// message loads the skill's SKILL.md.
    fn skill_activation(&self, session: &Session) -> Option<DeveloperMessage> {
        let text = last_user_text(session)?;
        let trimmed = text.trim_start();
        let rest = trimmed
            .strip_prefix("//skill:")
            .or_else(|| trimmed.strip_prefix("/skill:"))?;
        let name: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace())
            .collect();
        if name.is_empty() {
            return None;
        }

        let path = self
            .skill_dirs
            .iter()
            .map(|d| d.join(&name).join("SKILL.md"))
            .find(|p| p.is_file())?;
        let bytes = std::fs::read(&path).ok()?;
        let unchanged = session
            .file_tracker
            .get(&path)
            .map(|r| r.sha256 == klaude_session::FileTracker::sha256_hex(&bytes))
            .unwrap_or(false);
        if unchanged {
            return None;
        }
        session.file_tracker.record(&path, &bytes, true);
        Some(DeveloperMessage {
            parts: vec![Part::text(format!(
                "<system-reminder>\nSkill '{name}' activated. Follow these \
                 instructions:\n\n{}\n</system-reminder>",
                String::from_utf8_lossy(&bytes)
            ))],
            ui_extra: Some(DeveloperUIExtra {
                skill_name: Some(name),
                ..Default::default()
            }),
        })
    }
}

fn last_user_text(session: &Session) -> Option<String> {
    session.history.iter().rev().find_map(|e| match e {
        HistoryEvent::User(m) => Some(m.text()),
        _ => None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use klaude_protocol::{AssistantMessage, TodoItem, UserMessage};

    fn pipeline(dir: &Path) -> ReminderPipeline {
        // Point every search root inside the temp dir so the developer's own
        // home directory cannot leak into test results.
        ReminderPipeline {
            tools_cfg: ToolsSettings::default(),
            memory_dirs: vec![dir.to_path_buf()],
            skill_dirs: vec![dir.join(".klaude/skills")],
        }
    }

    fn session_in(dir: &Path) -> Session {
        Session::new(dir.to_path_buf())
    }

    #[test]
    fn memory_file_emitted_once_until_changed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "remember the build cmd").unwrap();
        let p = pipeline(dir.path());
        let session = session_in(dir.path());

        let first = p.run(&session, false);
        assert_eq!(first.len(), 1);
        assert!(first[0].text().contains("remember the build cmd"));

        // Unchanged file: silent on the next turn.
        assert!(p.run(&session, false).is_empty());

        // Changed file: re-emitted.
        std::fs::write(dir.path().join("AGENTS.md"), "new content").unwrap();
        let third = p.run(&session, false);
        assert_eq!(third.len(), 1);
        assert!(third[0].text().contains("new content"));
    }

    #[test]
    fn memory_name_priority_dedups_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "primary").unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "secondary").unwrap();
        let p = pipeline(dir.path());
        let session = session_in(dir.path());

        let msgs = p.run(&session, false);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].text().contains("primary"));
        assert!(!msgs[0].text().contains("secondary"));
    }

    #[test]
    fn at_file_mentions_are_resolved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "the notes").unwrap();
        std::fs::write(dir.path().join("with space.txt"), "spaced").unwrap();
        let p = pipeline(dir.path());
        let mut session = session_in(dir.path());
        session.push(HistoryEvent::User(UserMessage::from_text(
            r#"look at @notes.txt and @"with space.txt""#,
        )));

        let msgs = p.run(&session, false);
        assert_eq!(msgs.len(), 1);
        let text = msgs[0].text();
        assert!(text.contains("the notes"));
        assert!(text.contains("spaced"));
        let extra = msgs[0].ui_extra.as_ref().unwrap();
        assert_eq!(extra.at_files.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn at_file_content_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(1000)).unwrap();
        let mut p = pipeline(dir.path());
        p.tools_cfg.at_file_max_bytes = 100;
        let mut session = session_in(dir.path());
        session.push(HistoryEvent::User(UserMessage::from_text("see @big.txt")));

        let msgs = p.run(&session, false);
        assert!(msgs[0].text().contains("file truncated"));
    }

    #[test]
    fn external_edit_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.rs");
        std::fs::write(&path, "v1").unwrap();
        let p = pipeline(dir.path());
        let session = session_in(dir.path());
        session.file_tracker.record(&path, b"v1", false);

        // Sleep past the filesystem's mtime granularity so the cheap mtime
        // pre-check cannot mask the rewrite.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, "v2-external").unwrap();

        let msgs = p.run(&session, false);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].text().contains("changed on disk"));
        assert!(msgs[0].text().contains("src.rs"));

        // The tracker was refreshed; the same edit does not fire again.
        assert!(p.run(&session, false).is_empty());
    }

    #[test]
    fn deleted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.rs");
        std::fs::write(&path, "x").unwrap();
        let p = pipeline(dir.path());
        let session = session_in(dir.path());
        session.file_tracker.record(&path, b"x", false);
        std::fs::remove_file(&path).unwrap();

        let msgs = p.run(&session, false);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].text().contains("gone.rs"));
    }

    #[test]
    fn todo_hint_when_stale_and_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let mut session = session_in(dir.path());
        session.todos = vec![TodoItem {
            content: "pending work".into(),
            status: TodoStatus::Pending,
        }];
        session.push(HistoryEvent::Assistant(AssistantMessage::from_text("did things")));

        let msgs = p.run(&session, false);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].text().contains("incomplete"));

        // Suppressed when the last turn wrote todos.
        assert!(p.run(&session, true).is_empty());
    }

    #[test]
    fn todo_hint_suppressed_when_all_done() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let mut session = session_in(dir.path());
        session.todos = vec![TodoItem {
            content: "done".into(),
            status: TodoStatus::Completed,
        }];
        session.push(HistoryEvent::Assistant(AssistantMessage::from_text("x")));
        assert!(p.run(&session, false).is_empty());
    }

    #[test]
    fn skill_token_loads_skill_md() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join(".klaude/skills/deploy");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), "deployment steps").unwrap();
        let p = pipeline(dir.path());
        let mut session = session_in(dir.path());
        session.push(HistoryEvent::User(UserMessage::from_text(
            "/skill:deploy to staging",
        )));

        let msgs = p.run(&session, false);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].text().contains("deployment steps"));
        assert_eq!(
            msgs[0].ui_extra.as_ref().unwrap().skill_name.as_deref(),
            Some("deploy")
        );

        // Unchanged skill is not re-emitted.
        assert!(p.run(&session, false).is_empty());
    }

    #[test]
    fn unknown_skill_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let mut session = session_in(dir.path());
        session.push(HistoryEvent::User(UserMessage::from_text("/skill:nope")));
        assert!(p.run(&session, false).is_empty());
    }
}
