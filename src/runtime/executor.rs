//! Console session runtime executor

use super::traits::{
    LogStore, MicrophoneProbe, SpeakKind, TokenProvider, TransportConnector, TransportError,
    TransportErrorKind, TransportEvent, TransportHandle,
};
use super::SseEvent;

use crate::session_log::SessionLog;
use crate::state_machine::{transition, ConsoleContext, Effect, ErrorKind, Event, Mode, SessionState};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the per-connection transport event channel
const TRANSPORT_EVENT_BUFFER: usize = 64;

/// Generic session runtime that can work with any log store and transport
pub struct SessionRuntime<S, C>
where
    S: LogStore + 'static,
    C: TransportConnector + 'static,
{
    context: ConsoleContext,
    state: SessionState,
    session_log: SessionLog<S>,
    connector: Arc<C>,
    tokens: Arc<dyn TokenProvider>,
    microphone: Arc<dyn MicrophoneProbe>,
    /// Live transport, set once `Connected` is accepted
    transport: Option<TransportHandle>,
    /// Token to cancel an in-flight connect
    connect_cancel: Option<CancellationToken>,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    broadcast_tx: broadcast::Sender<SseEvent>,
    snapshot_tx: watch::Sender<SessionState>,
}

impl<S, C> SessionRuntime<S, C>
where
    S: LogStore + 'static,
    C: TransportConnector + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: ConsoleContext,
        session_log: SessionLog<S>,
        connector: Arc<C>,
        tokens: Arc<dyn TokenProvider>,
        microphone: Arc<dyn MicrophoneProbe>,
        event_rx: mpsc::Receiver<Event>,
        event_tx: mpsc::Sender<Event>,
        broadcast_tx: broadcast::Sender<SseEvent>,
        snapshot_tx: watch::Sender<SessionState>,
    ) -> Self {
        let state = context.initial_state();
        Self {
            context,
            state,
            session_log,
            connector,
            tokens,
            microphone,
            transport: None,
            connect_cancel: None,
            event_rx,
            event_tx,
            broadcast_tx,
            snapshot_tx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(console_id = %self.context.console_id, "Starting console runtime");

        while let Some(event) = self.event_rx.recv().await {
            self.process_event(event).await;
        }

        tracing::info!(console_id = %self.context.console_id, "Console runtime stopped");
    }

    /// Run an event and every event its effects produce, in arrival order
    async fn process_event(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(current) = queue.pop_front() {
            let result = match transition(&self.state, &self.context, current) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(console_id = %self.context.console_id, error = %e, "Intent rejected");
                    let _ = self.broadcast_tx.send(SseEvent::Error {
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let previous = self.state.phase;
            self.state = result.new_state;
            if previous != self.state.phase {
                tracing::info!(
                    console_id = %self.context.console_id,
                    from = previous.as_str(),
                    to = self.state.phase.as_str(),
                    "Phase changed"
                );
            }
            self.snapshot_tx.send_replace(self.state.clone());

            for effect in result.effects {
                if let Some(generated) = self.execute_effect(effect).await {
                    queue.push_back(generated);
                }
            }
        }
    }

    /// Execute an effect and optionally return a generated event
    #[allow(clippy::too_many_lines)] // One arm per effect
    async fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Connect => {
                self.spawn_connect();
                None
            }

            Effect::AttachTransport { transport } => {
                self.transport = Some(transport);
                self.connect_cancel = None;
                None
            }

            Effect::ReleaseTransport { transport } => {
                tracing::info!(console_id = %self.context.console_id, "Releasing late transport");
                tokio::spawn(async move {
                    if let Err(e) = transport.stop().await {
                        tracing::warn!(error = %e, "Failed to stop late transport");
                    }
                });
                None
            }

            Effect::OpenLog => {
                let session_id = self.session_log.open().await;
                Some(Event::LogOpened { session_id })
            }

            Effect::LogMessage { message } => {
                if !self.session_log.append(message.sender, &message.text).await {
                    tracing::warn!(
                        console_id = %self.context.console_id,
                        sender = %message.sender,
                        "Message not persisted"
                    );
                }
                // Appending may have replaced an expired session
                match self.session_log.current_id() {
                    Some(id) if self.state.log_session_id.as_deref() != Some(id) => {
                        Some(Event::LogSessionChanged {
                            session_id: id.to_string(),
                        })
                    }
                    _ => None,
                }
            }

            Effect::Speak { text, kind } => {
                let Some(transport) = self.transport.clone() else {
                    tracing::warn!(console_id = %self.context.console_id, "Speak without transport");
                    return None;
                };
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.speak(&text, kind).await {
                        let message = match kind {
                            SpeakKind::Talk => format!("Speak error: {e}"),
                            SpeakKind::Greeting => format!("Greeting error: {e}"),
                        };
                        let _ = event_tx.send(Event::TransportWarning { message }).await;
                    }
                });
                None
            }

            Effect::StartVoice {
                options,
                generation,
            } => {
                let Some(transport) = self.transport.clone() else {
                    return Some(Event::ModeSwitchFailed {
                        mode: Mode::Voice,
                        message: "No transport".to_string(),
                        generation,
                    });
                };
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let event = match transport.start_voice(&options).await {
                        Ok(()) => Event::ModeSwitched {
                            mode: Mode::Voice,
                            generation,
                        },
                        Err(e) => Event::ModeSwitchFailed {
                            mode: Mode::Voice,
                            message: e.to_string(),
                            generation,
                        },
                    };
                    let _ = event_tx.send(event).await;
                });
                None
            }

            Effect::StopVoice { generation } => {
                let Some(transport) = self.transport.clone() else {
                    return Some(Event::ModeSwitchFailed {
                        mode: Mode::Text,
                        message: "No transport".to_string(),
                        generation,
                    });
                };
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let event = match transport.stop_voice().await {
                        Ok(()) => Event::ModeSwitched {
                            mode: Mode::Text,
                            generation,
                        },
                        Err(e) => Event::ModeSwitchFailed {
                            mode: Mode::Text,
                            message: e.to_string(),
                            generation,
                        },
                    };
                    let _ = event_tx.send(event).await;
                });
                None
            }

            Effect::WarmUpVoice { options } => {
                let transport = self.transport.clone()?;
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.start_voice(&options).await {
                        let _ = event_tx
                            .send(Event::TransportWarning {
                                message: format!("Voice chat error: {e}"),
                            })
                            .await;
                    }
                });
                None
            }

            Effect::SetInputMuted { muted } => {
                let transport = self.transport.clone()?;
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.set_input_muted(muted).await {
                        let _ = event_tx
                            .send(Event::TransportWarning {
                                message: format!("Microphone error: {e}"),
                            })
                            .await;
                    }
                });
                None
            }

            Effect::Teardown {
                log_session_id,
                stop_voice,
            } => Some(self.teardown(log_session_id, stop_voice).await),

            Effect::ScheduleGreeting { delay, generation } => {
                self.schedule(delay, Event::GreetingDue { generation });
                None
            }

            Effect::ScheduleWarmup { delay, generation } => {
                self.schedule(delay, Event::WarmupDue { generation });
                None
            }

            Effect::ScheduleStatusClear { seq, delay } => {
                self.schedule(delay, Event::StatusExpired { seq });
                None
            }

            Effect::PublishState => {
                let state = serde_json::to_value(&self.state).unwrap_or(Value::Null);
                let _ = self.broadcast_tx.send(SseEvent::StateChange { state });
                None
            }

            Effect::NotifyClient { event_type, data } => {
                let event = match event_type.as_str() {
                    "message" => SseEvent::Message { message: data },
                    "diagnostic" => SseEvent::Diagnostic {
                        message: data["message"].as_str().unwrap_or_default().to_string(),
                    },
                    "status" => SseEvent::Status {
                        text: data["text"].as_str().map(String::from),
                    },
                    "user_talking" => SseEvent::UserTalking {
                        talking: data["talking"].as_bool().unwrap_or(false),
                    },
                    other => {
                        tracing::warn!(event_type = %other, "Unknown client notification");
                        return None;
                    }
                };
                let _ = self.broadcast_tx.send(event);
                None
            }
        }
    }

    /// Fetch a credential, probe the microphone and connect in the background.
    /// Once cancelled the outcome is no longer reported; a transport that
    /// still comes up is stopped right away.
    fn spawn_connect(&mut self) {
        let cancel = CancellationToken::new();
        self.connect_cancel = Some(cancel.clone());

        let tokens = self.tokens.clone();
        let microphone = self.microphone.clone();
        let connector = self.connector.clone();
        let options = self.context.start_options.clone();
        let event_tx = self.event_tx.clone();
        let console_id = self.context.console_id.clone();

        tokio::spawn(async move {
            let connect_cancel = cancel.clone();
            let forward_tx = event_tx.clone();
            let attempt = async move {
                let credential = tokens.fetch().await?;
                microphone.probe().await?;
                if connect_cancel.is_cancelled() {
                    return Err(TransportError::closed("Connect cancelled"));
                }

                let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
                forward_transport_events(transport_rx, forward_tx, connect_cancel);
                connector.connect(&credential, &options, transport_tx).await
            };
            tokio::pin!(attempt);

            let result = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!(console_id = %console_id, "Connect cancelled");
                    // The page may already be connecting; let it finish and stop it
                    if let Ok(transport) = attempt.await {
                        tracing::info!(console_id = %console_id, "Stopping transport of cancelled connect");
                        if let Err(e) = transport.stop().await {
                            tracing::warn!(console_id = %console_id, error = %e, "Failed to stop cancelled transport");
                        }
                    }
                    return;
                }

                result = &mut attempt => result,
            };

            let event = match result {
                Ok(transport) => {
                    tracing::info!(console_id = %console_id, "Transport connected");
                    Event::Connected {
                        transport: TransportHandle::new(transport),
                    }
                }
                Err(e) => {
                    tracing::warn!(console_id = %console_id, error = %e, "Connect failed");
                    let error_kind = match e.kind {
                        TransportErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                        _ => ErrorKind::TransportFailure,
                    };
                    Event::ConnectFailed {
                        error_kind,
                        message: e.message,
                    }
                }
            };
            let _ = event_tx.send(event).await;
        });
    }

    /// Best-effort teardown: every step runs even when an earlier one fails
    async fn teardown(&mut self, log_session_id: Option<String>, stop_voice: bool) -> Event {
        if let Some(cancel) = self.connect_cancel.take() {
            cancel.cancel();
        }

        let mut failures = Vec::new();

        if let Some(id) = log_session_id {
            if !self.session_log.close(&id).await {
                failures.push("Failed to close session log".to_string());
            }
        }

        if let Some(transport) = self.transport.take() {
            if stop_voice {
                if let Err(e) = transport.stop_voice().await {
                    failures.push(format!("Voice chat stop error: {e}"));
                }
            }
            if let Err(e) = transport.stop().await {
                failures.push(format!("Stop error: {e}"));
            }
        }

        if failures.is_empty() {
            tracing::info!(console_id = %self.context.console_id, "Session ended");
        } else {
            tracing::warn!(
                console_id = %self.context.console_id,
                failures = ?failures,
                "Session ended with cleanup failures"
            );
        }
        Event::TeardownComplete { failures }
    }

    fn schedule(&self, delay: std::time::Duration, event: Event) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(event).await;
        });
    }
}

/// Map transport events onto the runtime's event channel until either side
/// closes or the connect is cancelled
fn forward_transport_events(
    mut rx: mpsc::Receiver<TransportEvent>,
    event_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };
            if event_tx.send(Event::from(event)).await.is_err() {
                break;
            }
        }
    });
}
