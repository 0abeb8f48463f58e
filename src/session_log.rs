//! Session log: groups transcript messages under a time-bounded session
//!
//! Store failures never propagate. They are logged and reported as
//! `false`/`None` so the conversation keeps running without persistence.

use crate::db::{LoggedMessage, LoggedSession};
use crate::runtime::traits::{Clock, LogStore};
use crate::transcript::Sender;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Inactivity window after which a session is considered expired
pub const SESSION_TIMEOUT_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
struct ActiveSession {
    id: String,
    last_activity: DateTime<Utc>,
}

pub struct SessionLog<S: LogStore> {
    store: S,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    current: Option<ActiveSession>,
}

impl<S: LogStore> SessionLog<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            timeout: Duration::minutes(SESSION_TIMEOUT_MINUTES),
            current: None,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Id of the held session, if any
    pub fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.id.as_str())
    }

    /// Start a new session. A previously held session is closed first.
    pub async fn open(&mut self) -> Option<String> {
        if let Some(previous) = self.current.take() {
            self.close_remote(&previous.id).await;
        }

        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        match self
            .store
            .insert_session(&LoggedSession::active(&id, now))
            .await
        {
            Ok(()) => {
                tracing::info!(session_id = %id, "Session log opened");
                self.current = Some(ActiveSession {
                    id: id.clone(),
                    last_activity: now,
                });
                Some(id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open session log");
                None
            }
        }
    }

    /// Whether a session is held and has seen activity within the timeout.
    /// An expired session is closed as a side effect.
    pub async fn is_live(&mut self, now: DateTime<Utc>) -> bool {
        let Some(session) = &self.current else {
            return false;
        };
        if now - session.last_activity <= self.timeout {
            return true;
        }

        let id = session.id.clone();
        tracing::info!(session_id = %id, "Session log expired");
        self.current = None;
        self.close_remote(&id).await;
        false
    }

    /// Append a message, opening a replacement session when none is live.
    /// Returns true when the message is stored, including when an identical
    /// row already exists.
    pub async fn append(&mut self, sender: Sender, text: &str) -> bool {
        let now = self.clock.now();
        if !self.is_live(now).await && self.open().await.is_none() {
            return false;
        }
        let Some(session) = self.current.as_mut() else {
            return false;
        };

        match self.store.find_message(&session.id, sender, text).await {
            Ok(true) => {
                tracing::debug!(session_id = %session.id, %sender, "Message already logged");
                session.last_activity = now;
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Message lookup failed");
                return false;
            }
        }

        let record = LoggedMessage::new(&session.id, sender, text, now);
        match self.store.insert_message(&record).await {
            Ok(()) => {
                session.last_activity = now;
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to log message");
                false
            }
        }
    }

    /// Mark a session completed. Clears the held session when the id matches.
    pub async fn close(&mut self, session_id: &str) -> bool {
        if session_id.is_empty() {
            return false;
        }
        let closed = self.close_remote(session_id).await;
        if closed && self.current_id() == Some(session_id) {
            self.current = None;
        }
        closed
    }

    async fn close_remote(&self, session_id: &str) -> bool {
        match self.store.close_session(session_id, self.clock.now()).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, "Session log closed");
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to close session log");
                false
            }
        }
    }
}
