// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;

use klaude_protocol::{CheckpointEntry, HistoryEvent, TodoItem};

use crate::tracker::FileTracker;

/// In-memory session state.
///
/// Mutated only by the owning task executor; tools see scoped views (the
/// file tracker and a todo handle), never this struct.  History is
/// append-only except for checkpoint revert and compaction prefix
/// replacement.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub workdir: PathBuf,
    pub history: Vec<HistoryEvent>,
    pub file_tracker: FileTracker,
    pub todos: Vec<TodoItem>,
    pub next_checkpoint_id: u64,
    /// Approximate token count of the model-input portion of `history`.
    pub token_count: usize,
    /// Calibration factor from provider-reported usage; corrects the chars/4
    /// approximation for the current model and workload.
    pub calibration_factor: f64,
}

impl Session {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            workdir,
            history: Vec::new(),
            file_tracker: FileTracker::new(),
            todos: Vec::new(),
            next_checkpoint_id: 0,
            token_count: 0,
            calibration_factor: 1.0,
        }
    }

    /// Rebuild a session from events loaded off disk.
    pub fn from_history(id: String, workdir: PathBuf, history: Vec<HistoryEvent>) -> Self {
        let next_checkpoint_id = history
            .iter()
            .filter_map(|e| match e {
                HistoryEvent::Checkpoint(c) => Some(c.id + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let mut session = Self {
            id,
            workdir,
            history,
            file_tracker: FileTracker::new(),
            todos: Vec::new(),
            next_checkpoint_id,
            token_count: 0,
            calibration_factor: 1.0,
        };
        session.recalculate_tokens();
        session
    }

    pub fn push(&mut self, event: HistoryEvent) {
        self.token_count += event.approx_tokens();
        self.history.push(event);
    }

    pub fn push_many(&mut self, events: impl IntoIterator<Item = HistoryEvent>) {
        for e in events {
            self.push(e);
        }
    }

    /// Recalculate the token count from scratch (after compaction or revert).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.history.iter().map(HistoryEvent::approx_tokens).sum();
    }

    /// Token estimate corrected by the provider-usage calibration factor.
    pub fn calibrated_tokens(&self) -> usize {
        (self.token_count as f64 * self.calibration_factor) as usize
    }

    /// Update the calibration factor from a provider-reported input count.
    pub fn update_calibration(&mut self, actual_input_tokens: u64, estimated: usize) {
        if estimated > 0 && actual_input_tokens > 0 {
            self.calibration_factor = actual_input_tokens as f64 / estimated as f64;
        }
    }

    /// Append a checkpoint with the next strictly-increasing id.
    pub fn create_checkpoint(&mut self, user_message_snapshot: &str) -> CheckpointEntry {
        let entry = CheckpointEntry {
            id: self.next_checkpoint_id,
            user_message_snapshot: user_message_snapshot.to_string(),
            created_at: Utc::now(),
        };
        self.next_checkpoint_id += 1;
        self.push(HistoryEvent::Checkpoint(entry.clone()));
        entry
    }

    /// Index of the checkpoint event with the given id.
    pub fn checkpoint_index(&self, checkpoint_id: u64) -> Option<usize> {
        self.history.iter().position(
            |e| matches!(e, HistoryEvent::Checkpoint(c) if c.id == checkpoint_id),
        )
    }

    /// Drop every event after checkpoint `checkpoint_id` (the checkpoint
    /// itself is preserved).  Returns `false` when the id is unknown.
    pub fn truncate_to_checkpoint(&mut self, checkpoint_id: u64) -> bool {
        let Some(idx) = self.checkpoint_index(checkpoint_id) else {
            return false;
        };
        self.history.truncate(idx + 1);
        self.recalculate_tokens();
        true
    }

    /// First line of the first user message, for session listings.
    pub fn title(&self) -> Option<String> {
        self.history.iter().find_map(|e| match e {
            HistoryEvent::User(m) => {
                let text = m.text();
                let line = text.lines().next()?.trim();
                if line.is_empty() {
                    None
                } else {
                    Some(line.to_string())
                }
            }
            _ => None,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
