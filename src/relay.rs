//! Avatar transport over a WebSocket relay
//!
//! The avatar SDK runs in the browser page of a console. The page opens a
//! WebSocket to `/api/consoles/:id/relay`, executes the commands it receives
//! and forwards SDK events back. Everything the session runtime needs from
//! the avatar service goes through this relay.

mod link;
mod protocol;

pub use link::RelayLink;
pub use protocol::{RelayCommand, RelayFrame, RelayRequest};

use crate::runtime::traits::{
    AvatarTransport, Credential, MicrophoneProbe, SpeakKind, StartOptions, TransportConnector,
    TransportError, TransportErrorKind, TransportEvent, VoiceOptions,
};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Outgoing frames buffered per socket
const OUTGOING_BUFFER: usize = 32;

/// Pages currently attached, by console id
#[derive(Default)]
pub struct RelayHub {
    links: RwLock<HashMap<String, Arc<RelayLink>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page for a console. A page already attached is replaced and closed.
    pub async fn attach(&self, console_id: &str, outgoing: mpsc::Sender<String>) -> Arc<RelayLink> {
        let link = Arc::new(RelayLink::new(outgoing));
        let previous = self
            .links
            .write()
            .await
            .insert(console_id.to_string(), link.clone());
        if let Some(previous) = previous {
            tracing::info!(console_id = %console_id, "Replacing attached avatar page");
            previous.close().await;
        }
        link
    }

    pub async fn get(&self, console_id: &str) -> Option<Arc<RelayLink>> {
        self.links.read().await.get(console_id).cloned()
    }

    /// Remove `link` if it is still the one registered for the console
    pub async fn detach(&self, console_id: &str, link: &Arc<RelayLink>) {
        let mut links = self.links.write().await;
        if links.get(console_id).is_some_and(|l| Arc::ptr_eq(l, link)) {
            links.remove(console_id);
        }
    }

    async fn require(&self, console_id: &str) -> Result<Arc<RelayLink>, TransportError> {
        self.get(console_id)
            .await
            .ok_or_else(|| TransportError::connection("No avatar page attached"))
    }
}

/// Pump one page socket until it closes
pub async fn serve_socket(hub: Arc<RelayHub>, console_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_BUFFER);
    let link = hub.attach(&console_id, outgoing_tx).await;
    tracing::info!(console_id = %console_id, "Avatar page attached");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => link.handle_frame(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(console_id = %console_id, error = %e, "Relay socket error");
                break;
            }
        }
    }

    hub.detach(&console_id, &link).await;
    link.close().await;
    writer.abort();
    tracing::info!(console_id = %console_id, "Avatar page detached");
}

// ============================================================================
// Facade implementations
// ============================================================================

/// Connects through the page attached to a console
pub struct RelayConnector {
    hub: Arc<RelayHub>,
    console_id: String,
}

impl RelayConnector {
    pub fn new(hub: Arc<RelayHub>, console_id: impl Into<String>) -> Self {
        Self {
            hub,
            console_id: console_id.into(),
        }
    }
}

#[async_trait]
impl TransportConnector for RelayConnector {
    async fn connect(
        &self,
        credential: &Credential,
        options: &StartOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn AvatarTransport>, TransportError> {
        let link = self.hub.require(&self.console_id).await?;
        link.set_events(events).await;

        let command = RelayCommand::Connect {
            token: credential.expose().to_string(),
            options: options.clone(),
        };
        if let Err(e) = link.request(command).await {
            link.clear_events().await;
            return Err(TransportError::connection(e.message));
        }
        Ok(Arc::new(RelayTransport { link }))
    }
}

/// Established transport; every call is a relay round trip
pub struct RelayTransport {
    link: Arc<RelayLink>,
}

#[async_trait]
impl AvatarTransport for RelayTransport {
    async fn speak(&self, text: &str, kind: SpeakKind) -> Result<(), TransportError> {
        self.link
            .request(RelayCommand::Speak {
                text: text.to_string(),
                kind,
            })
            .await
    }

    async fn start_voice(&self, options: &VoiceOptions) -> Result<(), TransportError> {
        self.link
            .request(RelayCommand::StartVoice {
                options: options.clone(),
            })
            .await
    }

    async fn stop_voice(&self) -> Result<(), TransportError> {
        self.link.request(RelayCommand::StopVoice).await
    }

    async fn set_input_muted(&self, muted: bool) -> Result<(), TransportError> {
        self.link.request(RelayCommand::SetInputMuted { muted }).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let result = self.link.request(RelayCommand::Stop).await;
        self.link.clear_events().await;
        result
    }
}

/// Asks the attached page for microphone access
pub struct RelayMicrophoneProbe {
    hub: Arc<RelayHub>,
    console_id: String,
}

impl RelayMicrophoneProbe {
    pub fn new(hub: Arc<RelayHub>, console_id: impl Into<String>) -> Self {
        Self {
            hub,
            console_id: console_id.into(),
        }
    }
}

#[async_trait]
impl MicrophoneProbe for RelayMicrophoneProbe {
    async fn probe(&self) -> Result<(), TransportError> {
        let link = self.hub.require(&self.console_id).await?;
        link.request(RelayCommand::ProbeMicrophone)
            .await
            .map_err(|e| match e.kind {
                TransportErrorKind::Command => TransportError::permission_denied(e.message),
                _ => e,
            })
    }
}
