//! One WebSocket connection to an avatar page

use super::protocol::{RelayCommand, RelayFrame, RelayRequest};
use crate::runtime::traits::{TransportError, TransportEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// How long a command may wait for its reply
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = HashMap<u64, oneshot::Sender<Result<(), String>>>;

/// Correlates commands with replies and routes SDK events to the session
pub struct RelayLink {
    outgoing: mpsc::Sender<String>,
    pending: Mutex<Pending>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RelayLink {
    /// `outgoing` receives serialized frames for the socket writer
    pub fn new(outgoing: mpsc::Sender<String>) -> Self {
        Self {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
            next_id: AtomicU64::new(1),
            timeout: COMMAND_TIMEOUT,
        }
    }

    #[must_use]
    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route SDK events to `events` until cleared
    pub async fn set_events(&self, events: mpsc::Sender<TransportEvent>) {
        *self.events.lock().await = Some(events);
    }

    pub async fn clear_events(&self) {
        self.events.lock().await.take();
    }

    /// Send a command and wait for the page to acknowledge it
    pub async fn request(&self, command: RelayCommand) -> Result<(), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = command.name();
        let frame = serde_json::to_string(&RelayRequest { id, command })
            .map_err(|e| TransportError::command(format!("Failed to encode {name}: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::closed("Avatar page disconnected"));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(TransportError::command(message)),
            Ok(Err(_)) => Err(TransportError::closed("Avatar page disconnected")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!(command = name, id, "Relay command timed out");
                Err(TransportError::command(format!("{name} timed out")))
            }
        }
    }

    /// Handle one text frame from the page
    pub async fn handle_frame(&self, text: &str) {
        let frame: RelayFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed relay frame");
                return;
            }
        };

        match frame {
            RelayFrame::Reply { id, ok, error } => {
                let Some(waiter) = self.pending.lock().await.remove(&id) else {
                    tracing::debug!(id, "Reply for unknown request");
                    return;
                };
                let outcome = if ok {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "Command failed".to_string()))
                };
                let _ = waiter.send(outcome);
            }
            RelayFrame::Event { event } => {
                let sink = self.events.lock().await.clone();
                match sink {
                    Some(sink) => {
                        if sink.send(event).await.is_err() {
                            self.clear_events().await;
                        }
                    }
                    None => tracing::debug!(?event, "Dropping event with no session attached"),
                }
            }
        }
    }

    /// The socket is gone: fail pending commands and tell the session
    pub async fn close(&self) {
        self.pending.lock().await.clear();
        if let Some(sink) = self.events.lock().await.take() {
            let _ = sink.send(TransportEvent::StreamDisconnected).await;
        }
    }
}
