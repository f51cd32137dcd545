// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Coordinates one-at-a-time user interactions across the whole process.
//!
//! Interactive tools call [`UserInteractionManager::request`] and suspend on
//! a future; the UI answers through the `UserInteractionRespond` operation,
//! which lands in [`UserInteractionManager::respond`].  At most one request
//! may be pending at any instant — a second concurrent request errors
//! instead of queueing, so the model sees a deterministic failure.

use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use klaude_protocol::{
    Event, EventPayload, UserInteractionRequestPayload, UserInteractionResponse,
    UserInteractionSource, UserInteractionStatus,
};
use klaude_tools::InteractionRequester;

/// A pending request as exposed to the UI for recovery after reconnect.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub session_id: String,
    pub source: UserInteractionSource,
    pub tool_call_id: Option<String>,
    pub payload: UserInteractionRequestPayload,
}

struct PendingState {
    request: PendingRequest,
    // `None` through this channel means the request was cancelled.
    answer_tx: oneshot::Sender<Option<UserInteractionResponse>>,
}

pub struct UserInteractionManager {
    events: mpsc::UnboundedSender<Event>,
    pending: Mutex<Option<PendingState>>,
}

impl UserInteractionManager {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            pending: Mutex::new(None),
        }
    }

    /// Snapshot of the outstanding request, if any.
    pub fn pending_request(&self) -> Option<PendingRequest> {
        self.pending
            .lock()
            .expect("interaction manager poisoned")
            .as_ref()
            .map(|p| p.request.clone())
    }

    /// Deliver the user's answer.  Validates the request id, session id and
    /// (for submitted answers) payload presence.
    pub fn respond(
        &self,
        request_id: &str,
        session_id: &str,
        response: UserInteractionResponse,
    ) -> anyhow::Result<()> {
        let mut pending = self.pending.lock().expect("interaction manager poisoned");
        let Some(state) = pending.as_ref() else {
            bail!("No pending user interaction");
        };
        if state.request.request_id != request_id {
            bail!("Unknown user interaction request id: {request_id}");
        }
        if state.request.session_id != session_id {
            bail!("Session mismatch for pending user interaction");
        }
        if response.status == UserInteractionStatus::Submitted && response.payload.is_none() {
            bail!("Submitted response must include payload");
        }
        let state = pending.take().expect("checked above");
        let _ = state.answer_tx.send(Some(response));
        Ok(())
    }

    /// Cancel the outstanding request, if any (optionally only when it
    /// belongs to `session_id`).  The suspended tool observes `None` and
    /// returns its controlled decline result.
    pub fn cancel_pending(&self, session_id: Option<&str>) -> bool {
        let mut pending = self.pending.lock().expect("interaction manager poisoned");
        match pending.as_ref() {
            None => false,
            Some(state) => {
                if let Some(sid) = session_id {
                    if state.request.session_id != sid {
                        return false;
                    }
                }
                let state = pending.take().expect("checked above");
                debug!(request_id = %state.request.request_id, "cancelling pending user interaction");
                let _ = state.answer_tx.send(None);
                true
            }
        }
    }
}

#[async_trait]
impl InteractionRequester for UserInteractionManager {
    async fn request(
        &self,
        request_id: String,
        session_id: String,
        source: UserInteractionSource,
        payload: UserInteractionRequestPayload,
        tool_call_id: Option<String>,
    ) -> anyhow::Result<Option<UserInteractionResponse>> {
        let answer_rx = {
            let mut pending = self.pending.lock().expect("interaction manager poisoned");
            if pending.is_some() {
                bail!("Only one user interaction can be pending at a time");
            }
            let (answer_tx, answer_rx) = oneshot::channel();
            let request = PendingRequest {
                request_id: request_id.clone(),
                session_id: session_id.clone(),
                source,
                tool_call_id: tool_call_id.clone(),
                payload: payload.clone(),
            };
            *pending = Some(PendingState { request, answer_tx });
            answer_rx
        };

        let _ = self.events.send(Event::new(
            session_id,
            EventPayload::UserInteractionRequest {
                request_id,
                source,
                tool_call_id,
                payload,
            },
        ));

        // A dropped sender (manager torn down) reads as a cancellation.
        Ok(answer_rx.await.unwrap_or(None))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager() -> (Arc<UserInteractionManager>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(UserInteractionManager::new(tx)), rx)
    }

    fn payload() -> UserInteractionRequestPayload {
        UserInteractionRequestPayload {
            questions: vec![klaude_protocol::Question {
                question: "?".into(),
                options: vec![],
                multi_select: false,
            }],
        }
    }

    #[tokio::test]
    async fn request_resolves_on_respond() {
        let (m, mut events) = manager();
        let m2 = Arc::clone(&m);
        let task = tokio::spawn(async move {
            m2.request(
                "r1".into(),
                "s1".into(),
                UserInteractionSource::AskUserQuestion,
                payload(),
                None,
            )
            .await
        });

        // Wait until the request event is out (the request is registered).
        let ev = events.recv().await.unwrap();
        assert!(matches!(
            ev.payload,
            EventPayload::UserInteractionRequest { ref request_id, .. } if request_id == "r1"
        ));

        m.respond(
            "r1",
            "s1",
            UserInteractionResponse::submitted(serde_json::json!({"a": 1})),
        )
        .unwrap();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.unwrap().status, UserInteractionStatus::Submitted);
        assert!(m.pending_request().is_none());
    }

    #[tokio::test]
    async fn second_concurrent_request_errors() {
        let (m, mut _events) = manager();
        let m2 = Arc::clone(&m);
        let _first = tokio::spawn(async move {
            m2.request(
                "r1".into(),
                "s1".into(),
                UserInteractionSource::AskUserQuestion,
                payload(),
                None,
            )
            .await
        });
        // Let the first request register.
        tokio::task::yield_now().await;
        while m.pending_request().is_none() {
            tokio::task::yield_now().await;
        }

        let err = m
            .request(
                "r2".into(),
                "s1".into(),
                UserInteractionSource::AskUserQuestion,
                payload(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("one user interaction"));
    }

    #[tokio::test]
    async fn cancel_pending_resolves_with_none() {
        let (m, mut _events) = manager();
        let m2 = Arc::clone(&m);
        let task = tokio::spawn(async move {
            m2.request(
                "r1".into(),
                "s1".into(),
                UserInteractionSource::AskUserQuestion,
                payload(),
                None,
            )
            .await
        });
        while m.pending_request().is_none() {
            tokio::task::yield_now().await;
        }

        assert!(m.cancel_pending(Some("s1")));
        let result = task.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cancel_with_wrong_session_is_refused() {
        let (m, mut _events) = manager();
        let m2 = Arc::clone(&m);
        let _task = tokio::spawn(async move {
            m2.request(
                "r1".into(),
                "s1".into(),
                UserInteractionSource::AskUserQuestion,
                payload(),
                None,
            )
            .await
        });
        while m.pending_request().is_none() {
            tokio::task::yield_now().await;
        }
        assert!(!m.cancel_pending(Some("other-session")));
        assert!(m.pending_request().is_some());
    }

    #[tokio::test]
    async fn respond_validates_ids_and_payload() {
        let (m, mut _events) = manager();
        assert!(m
            .respond("r1", "s1", UserInteractionResponse::cancelled())
            .is_err());

        let m2 = Arc::clone(&m);
        let _task = tokio::spawn(async move {
            m2.request(
                "r1".into(),
                "s1".into(),
                UserInteractionSource::AskUserQuestion,
                payload(),
                None,
            )
            .await
        });
        while m.pending_request().is_none() {
            tokio::task::yield_now().await;
        }

        // Wrong request id
        assert!(m
            .respond("r9", "s1", UserInteractionResponse::cancelled())
            .is_err());
        // Wrong session
        assert!(m
            .respond("r1", "s9", UserInteractionResponse::cancelled())
            .is_err());
        // Submitted without payload
        let bad = UserInteractionResponse {
            status: UserInteractionStatus::Submitted,
            payload: None,
        };
        assert!(m.respond("r1", "s1", bad).is_err());
        // Still pending after rejected responses
        assert!(m.pending_request().is_some());
    }
}
