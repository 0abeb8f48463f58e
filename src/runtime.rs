//! Runtime for executing console sessions
//!
//! Each console gets one `SessionRuntime` task that owns the controller
//! state, the session log and the transport handle.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;
pub use traits::*;

use crate::config::ConsoleSettings;
use crate::db::Database;
use crate::relay::{RelayConnector, RelayHub, RelayMicrophoneProbe};
use crate::session_log::SessionLog;
use crate::state_machine::{ConsoleContext, Event, SessionState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

/// Type alias for production runtime with concrete implementations
pub type ProductionRuntime = SessionRuntime<DatabaseStorage, RelayConnector>;

/// Manager for all console runtimes
pub struct RuntimeManager {
    db: Database,
    settings: ConsoleSettings,
    tokens: Arc<dyn TokenProvider>,
    relays: Arc<RelayHub>,
    runtimes: RwLock<HashMap<String, ConsoleHandle>>,
}

/// Handle to interact with a running console
#[derive(Clone)]
pub struct ConsoleHandle {
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_tx: broadcast::Sender<SseEvent>,
    pub snapshot_rx: watch::Receiver<SessionState>,
}

/// Events sent to SSE clients
#[derive(Debug, Clone)]
pub enum SseEvent {
    Init {
        state: serde_json::Value,
    },
    Message {
        message: serde_json::Value,
    },
    StateChange {
        state: serde_json::Value,
    },
    Diagnostic {
        message: String,
    },
    Status {
        text: Option<String>,
    },
    UserTalking {
        talking: bool,
    },
    Error {
        message: String,
    },
}

impl RuntimeManager {
    pub fn new(db: Database, settings: ConsoleSettings, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            db,
            settings,
            tokens,
            relays: Arc::new(RelayHub::new()),
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the runtime for a console
    pub async fn get_or_create(&self, console_id: &str) -> ConsoleHandle {
        if let Some(handle) = self.runtimes.read().await.get(console_id) {
            return handle.clone();
        }

        let mut runtimes = self.runtimes.write().await;
        // Another request may have created it while we waited for the lock
        if let Some(handle) = runtimes.get(console_id) {
            return handle.clone();
        }

        let context = ConsoleContext::new(console_id, self.settings.start_options.clone())
            .with_greeting(self.settings.greeting.clone());
        let (event_tx, event_rx) = mpsc::channel(128);
        let (broadcast_tx, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(context.initial_state());

        let session_log = SessionLog::new(
            DatabaseStorage::new(self.db.clone()),
            Arc::new(SystemClock),
        );
        let connector = RelayConnector::new(self.relays.clone(), console_id);
        let microphone = RelayMicrophoneProbe::new(self.relays.clone(), console_id);

        let runtime: ProductionRuntime = SessionRuntime::new(
            context,
            session_log,
            Arc::new(connector),
            self.tokens.clone(),
            Arc::new(microphone),
            event_rx,
            event_tx.clone(),
            broadcast_tx.clone(),
            snapshot_tx,
        );

        let id = console_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(console_id = %id, "Console runtime finished");
        });

        let handle = ConsoleHandle {
            event_tx,
            broadcast_tx,
            snapshot_rx,
        };
        runtimes.insert(console_id.to_string(), handle.clone());
        handle
    }

    /// Send an event to a console
    pub async fn send_event(&self, console_id: &str, event: Event) -> Result<(), String> {
        let handle = self.get_or_create(console_id).await;
        handle
            .event_tx
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {e}"))
    }

    /// Subscribe to console updates, returning the current state with the receiver
    pub async fn subscribe(
        &self,
        console_id: &str,
    ) -> (SessionState, broadcast::Receiver<SseEvent>) {
        let handle = self.get_or_create(console_id).await;
        let rx = handle.broadcast_tx.subscribe();
        let state = handle.snapshot_rx.borrow().clone();
        (state, rx)
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn relays(&self) -> &Arc<RelayHub> {
        &self.relays
    }
}
