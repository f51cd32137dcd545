// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only on-disk session store.
//!
//! One events file per session (`events.jsonl`), one background writer task
//! per session.  The events file is never rewritten: checkpoint revert is an
//! appended marker record applied when the file is replayed, which keeps
//! writes lock-free beyond the per-session writer and makes crashes
//! recoverable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use klaude_protocol::HistoryEvent;

use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record at {path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("revert marker references unknown checkpoint {0}")]
    UnknownCheckpoint(u64),
    #[error("session events file not found: {0}")]
    NotFound(PathBuf),
    #[error("session writer is gone")]
    WriterGone,
    #[error("background write failed: {0}")]
    WriteFailed(String),
}

/// One on-disk line.  `Event` flattens the history event so existing lines
/// read naturally (`{"record":"event","type":"user",...}`); `Revert` is the
/// append-only checkpoint-revert marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum SessionRecord {
    Event {
        #[serde(flatten)]
        event: HistoryEvent,
    },
    Revert {
        checkpoint_id: u64,
        note: String,
        rationale: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

enum WriterMsg {
    Append(Vec<SessionRecord>),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Store rooted at `<root>/<project-key>/`.
pub struct SessionStore {
    project_dir: PathBuf,
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<WriterMsg>>>,
}

/// Flatten a workspace path into a directory-name-safe project key.
pub fn project_key(workdir: &Path) -> String {
    let raw = workdir.to_string_lossy();
    let key: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c => c,
        })
        .collect();
    key.trim_matches('-').to_string()
}

impl SessionStore {
    /// `root` defaults to `~/.klaude/sessions`.
    pub fn new(root: Option<PathBuf>, workdir: &Path) -> Self {
        let root = root.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".klaude")
                .join("sessions")
        });
        Self {
            project_dir: root.join(project_key(workdir)),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.project_dir.join(session_id)
    }

    pub fn events_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("events.jsonl")
    }

    /// Overflow directory used by the tool-output offload policy.
    pub fn artifacts_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("artifacts")
    }

    fn index_path(&self) -> PathBuf {
        self.project_dir.join("index.json")
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Enqueue a batch for the session's background writer.  Returns without
    /// waiting for the flush; callers that need durability follow up with
    /// [`wait_for_flush`](Self::wait_for_flush).
    pub async fn append_history(
        &self,
        session_id: &str,
        events: &[HistoryEvent],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let records = events
            .iter()
            .cloned()
            .map(|event| SessionRecord::Event { event })
            .collect();
        self.send(session_id, WriterMsg::Append(records)).await
    }

    async fn append_records(
        &self,
        session_id: &str,
        records: Vec<SessionRecord>,
    ) -> Result<(), StoreError> {
        self.send(session_id, WriterMsg::Append(records)).await
    }

    /// Block until every previously enqueued batch for the session reached
    /// the file.  Reports the first background write error, if any.
    pub async fn wait_for_flush(&self, session_id: &str) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(session_id, WriterMsg::Flush(tx)).await?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(StoreError::WriteFailed(msg)),
            Err(_) => Err(StoreError::WriterGone),
        }
    }

    async fn send(&self, session_id: &str, msg: WriterMsg) -> Result<(), StoreError> {
        let mut writers = self.writers.lock().await;
        let tx = match writers.get(session_id) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = self.spawn_writer(session_id)?;
                writers.insert(session_id.to_string(), tx.clone());
                tx
            }
        };
        tx.send(msg).map_err(|_| StoreError::WriterGone)
    }

    /// Single writer per session: all appends are serialised through its
    /// channel, so concurrent callers always observe a totally-ordered file.
    fn spawn_writer(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedSender<WriterMsg>, StoreError> {
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;
        let path = self.events_path(session_id);
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMsg>();

        tokio::spawn(async move {
            let mut file: Option<tokio::fs::File> = None;
            // First failure is remembered and surfaced on the next flush
            // wait; the writer keeps accepting appends so the engine can
            // continue with in-memory state.
            let mut last_error: Option<String> = None;

            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Append(records) => {
                        if file.is_none() {
                            match tokio::fs::OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(&path)
                                .await
                            {
                                Ok(f) => file = Some(f),
                                Err(e) => {
                                    warn!(path = %path.display(), error = %e, "session writer open failed");
                                    last_error.get_or_insert(e.to_string());
                                    continue;
                                }
                            }
                        }
                        let f = file.as_mut().expect("file opened above");
                        let mut buf = String::new();
                        for record in &records {
                            match serde_json::to_string(record) {
                                Ok(line) => {
                                    buf.push_str(&line);
                                    buf.push('\n');
                                }
                                Err(e) => {
                                    last_error.get_or_insert(e.to_string());
                                }
                            }
                        }
                        if let Err(e) = f.write_all(buf.as_bytes()).await {
                            warn!(path = %path.display(), error = %e, "session write failed");
                            last_error.get_or_insert(e.to_string());
                            continue;
                        }
                        if let Err(e) = f.flush().await {
                            last_error.get_or_insert(e.to_string());
                        }
                    }
                    WriterMsg::Flush(done) => {
                        let result = match &last_error {
                            Some(msg) => Err(msg.clone()),
                            None => Ok(()),
                        };
                        let _ = done.send(result);
                    }
                }
            }
            debug!(path = %path.display(), "session writer stopped");
        });

        Ok(tx)
    }

    // ── Checkpoints ──────────────────────────────────────────────────────────

    /// Revert the session to checkpoint `checkpoint_id`: truncate the
    /// in-memory history to just after the checkpoint event, append a
    /// developer note explaining the revert, and append the marker + note to
    /// the events file.  The on-disk file stays append-only; `load` applies
    /// the marker to reconstruct the identical history.
    pub async fn revert_to_checkpoint(
        &self,
        session: &mut Session,
        checkpoint_id: u64,
        note: &str,
        rationale: &str,
    ) -> Result<(), StoreError> {
        if !session.truncate_to_checkpoint(checkpoint_id) {
            return Err(StoreError::UnknownCheckpoint(checkpoint_id));
        }
        let note_event = HistoryEvent::Developer(klaude_protocol::DeveloperMessage::from_text(
            format!("<system-reminder>Reverted to checkpoint {checkpoint_id}: {note}. {rationale}</system-reminder>"),
        ));
        session.push(note_event.clone());

        self.append_records(
            &session.id,
            vec![
                SessionRecord::Revert {
                    checkpoint_id,
                    note: note.to_string(),
                    rationale: rationale.to_string(),
                },
                SessionRecord::Event { event: note_event },
            ],
        )
        .await
    }

    // ── Loading ──────────────────────────────────────────────────────────────

    /// Replay the events file.  Malformed records abort with a clear error;
    /// a missing file yields an empty history when `skip_if_missing` (used
    /// when `InitAgent` creates a fresh session).
    pub fn load(
        &self,
        session_id: &str,
        skip_if_missing: bool,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let path = self.events_path(session_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if skip_if_missing {
                    return Ok(Vec::new());
                }
                return Err(StoreError::NotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        let mut history: Vec<HistoryEvent> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SessionRecord =
                serde_json::from_str(line).map_err(|source| StoreError::Malformed {
                    path: path.clone(),
                    line: lineno + 1,
                    source,
                })?;
            match record {
                // A compaction entry replaces everything below its
                // first-kept index, mirroring the in-memory rewrite so the
                // reloaded history is identical.
                SessionRecord::Event {
                    event: HistoryEvent::Compaction(entry),
                } => {
                    let first_kept = entry.first_kept_index.min(history.len());
                    let retained = history.split_off(first_kept);
                    history.clear();
                    history.push(HistoryEvent::Compaction(entry));
                    history.extend(retained);
                }
                SessionRecord::Event { event } => history.push(event),
                SessionRecord::Revert { checkpoint_id, .. } => {
                    let idx = history
                        .iter()
                        .rposition(|e| {
                            matches!(e, HistoryEvent::Checkpoint(c) if c.id == checkpoint_id)
                        })
                        .ok_or(StoreError::UnknownCheckpoint(checkpoint_id))?;
                    history.truncate(idx + 1);
                }
            }
        }
        Ok(history)
    }

    // ── Index & listing ──────────────────────────────────────────────────────

    pub fn list_sessions(&self) -> Vec<SessionIndexEntry> {
        let Ok(text) = std::fs::read_to_string(self.index_path()) else {
            return Vec::new();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }

    /// Upsert the session into the project index.  The index is rewritten
    /// atomically (temp file + rename) so concurrent readers never observe a
    /// torn file.
    pub fn update_index(&self, session: &Session) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.project_dir)?;
        let mut entries = self.list_sessions();
        let now = Utc::now();
        match entries.iter_mut().find(|e| e.id == session.id) {
            Some(entry) => {
                entry.title = session.title();
                entry.updated_at = now;
            }
            None => entries.push(SessionIndexEntry {
                id: session.id.clone(),
                title: session.title(),
                created_at: now,
                updated_at: now,
            }),
        }
        let tmp = self.index_path().with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&entries).expect("index serialises"))?;
        std::fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    pub fn known_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.list_sessions().into_iter().map(|e| e.id).collect();
        // Sessions written before the index existed are still discoverable
        // from their directories.
        if let Ok(entries) = std::fs::read_dir(&self.project_dir) {
            for entry in entries.flatten() {
                if entry.path().join("events.jsonl").is_file() {
                    let id = entry.file_name().to_string_lossy().to_string();
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        ids
    }

    /// Shortest prefix of `session_id` that is unambiguous among all known
    /// sessions of this project.  Falls back to the full id.
    pub fn shortest_unique_prefix(&self, session_id: &str) -> String {
        let others: Vec<String> = self
            .known_session_ids()
            .into_iter()
            .filter(|id| id != session_id)
            .collect();
        for len in 1..=session_id.len() {
            let prefix = &session_id[..len];
            if !others.iter().any(|id| id.starts_with(prefix)) {
                return prefix.to_string();
            }
        }
        session_id.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
