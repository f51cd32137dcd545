// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tokio::sync::mpsc;

use klaude_protocol::{Event, EventPayload};

/// Session-bound handle on the global event queue.
///
/// The queue is unbounded: a slow UI grows memory but never drops or
/// reorders a session's events.  Cloning rebinds the session id for
/// sub-agent event streams.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
    session_id: String,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<Event>, session_id: impl Into<String>) -> Self {
        Self {
            tx,
            session_id: session_id.into(),
        }
    }

    /// The same queue, bound to a different session (used for sub-agents).
    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit one event.  A closed queue (UI gone during shutdown) is not an
    /// error for the engine.
    pub fn emit(&self, payload: EventPayload) {
        let _ = self.tx.send(Event::new(self.session_id.clone(), payload));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_with_bound_session_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(tx, "s1");
        sender.emit(EventPayload::TaskStart);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.session_id, "s1");
    }

    #[tokio::test]
    async fn for_session_rebinds_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(tx, "parent");
        sender.for_session("child").emit(EventPayload::TaskStart);
        assert_eq!(rx.recv().await.unwrap().session_id, "child");
    }

    #[test]
    fn closed_queue_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        EventSender::new(tx, "s").emit(EventPayload::TaskStart);
    }
}
