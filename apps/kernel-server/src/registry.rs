// [[CONDUIT]]/apps/kernel-server/src/registry.rs
// Purpose: Session Registry. Live execution handles keyed by session id.
// Architecture: Runtime Layer
// Dependencies: DashMap, tokio-util

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{KernelError, KernelResult};
use crate::protocol::UserAction;

const INBOX_CAPACITY: usize = 32;

/// Handle to a live session. Cloning shares the same cancellation and running flag.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub task_id: String,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    inbox: mpsc::Sender<UserAction>,
}

impl SessionHandle {
    /// Returns the handle plus the receiving end of its inbox, which goes to the executor.
    pub fn new(session_id: &str, task_id: &str, scope: &str) -> (Self, mpsc::Receiver<UserAction>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = SessionHandle {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            scope: scope.to_string(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(true)),
            inbox: tx,
        };
        (handle, rx)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Asks the session to stop at its next checkpoint. Does not wait.
    pub fn request_stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn mark_finished(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Hands a user action to the session without blocking the caller.
    pub fn deliver(&self, action: UserAction) -> KernelResult<()> {
        self.inbox.try_send(action).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                KernelError::Transport(format!("inbox of session {} is full", self.session_id))
            }
            mpsc::error::TrySendError::Closed(_) => KernelError::session_not_found(&self.session_id),
        })
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            task_id: self.task_id.clone(),
            scope: self.scope.clone(),
            is_running: self.is_running(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub task_id: String,
    pub scope: String,
    pub is_running: bool,
    pub started_at: DateTime<Utc>,
}

/// Owns only execution handles; task lifecycle lives in the task store.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SessionHandle) -> KernelResult<()> {
        match self.sessions.entry(handle.session_id.clone()) {
            Entry::Occupied(_) => {
                tracing::error!("Session id collision: {}", handle.session_id);
                Err(KernelError::Duplicate {
                    kind: "session",
                    id: handle.session_id,
                })
            }
            Entry::Vacant(slot) => {
                tracing::debug!("Registered session {} for task {}", handle.session_id, handle.task_id);
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, session_id: &str) -> KernelResult<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| KernelError::session_not_found(session_id))
    }

    pub fn stop(&self, session_id: &str) -> KernelResult<()> {
        let handle = self.get(session_id)?;
        handle.request_stop();
        tracing::info!("Stop requested for session {} (task {})", session_id, handle.task_id);
        Ok(())
    }

    /// Called once, by whoever observed the session's terminal transition.
    pub fn unregister(&self, session_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(session_id).map(|(_, h)| h);
        if removed.is_none() {
            tracing::warn!("Unregister of unknown session {}", session_id);
        }
        removed
    }

    /// The running session whose events land in `scope`, if any.
    pub fn find_by_scope(&self, scope: &str) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|h| h.scope == scope && h.is_running())
            .map(|h| h.value().clone())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions.iter().map(|h| h.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = SessionHandle::new("s1", "t1", "t1");
        let (b, _rx_b) = SessionHandle::new("s1", "t2", "t2");
        registry.register(a).expect("first");
        let err = registry.register(b).expect_err("second");
        assert!(matches!(err, KernelError::Duplicate { kind: "session", .. }));
        assert_eq!(registry.get("s1").expect("get").task_id, "t1");
    }

    #[test]
    fn stop_flags_the_shared_handle() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = SessionHandle::new("s1", "t1", "conv");
        let token = handle.cancellation();
        registry.register(handle.clone()).expect("register");

        registry.stop("s1").expect("stop");
        assert!(token.is_cancelled());
        assert!(!handle.is_running());
        // Stop does not remove; the session's owner unregisters after it winds down.
        assert!(registry.get("s1").is_ok());
        assert!(registry.find_by_scope("conv").is_none());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = SessionRegistry::new();
        assert!(registry.get("ghost").expect_err("missing").is_not_found());
        assert!(registry.stop("ghost").expect_err("missing").is_not_found());
        assert!(registry.unregister("ghost").is_none());
    }

    #[test]
    fn unregister_removes_exactly_once() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = SessionHandle::new("s1", "t1", "t1");
        registry.register(handle).expect("register");
        assert!(registry.unregister("s1").is_some());
        assert!(registry.unregister("s1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn deliver_reaches_the_inbox() {
        let (handle, mut rx) = SessionHandle::new("s1", "t1", "t1");
        handle
            .deliver(UserAction::Message { content: "hello".into(), payload: serde_json::json!({}) })
            .expect("deliver");
        let action = rx.recv().await.expect("action");
        assert!(matches!(action, UserAction::Message { content, .. } if content == "hello"));

        drop(rx);
        let err = handle
            .deliver(UserAction::Message { content: "late".into(), payload: serde_json::json!({}) })
            .expect_err("closed inbox");
        assert!(err.is_not_found());
    }
}
