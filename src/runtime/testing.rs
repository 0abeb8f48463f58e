//! Mock implementations for testing
//!
//! These mocks enable integration testing without a browser or database.

use super::traits::*;
use crate::db::{LoggedMessage, LoggedSession, SessionStatus};
use crate::runtime::{SessionRuntime, SseEvent};
use crate::session_log::SessionLog;
use crate::state_machine::{ConsoleContext, Event, Phase, SessionState};
use crate::transcript::Sender;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

// ============================================================================
// Mock Transport
// ============================================================================

/// A call recorded by `MockTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Speak { text: String, kind: SpeakKind },
    StartVoice(VoiceOptions),
    StopVoice,
    SetInputMuted(bool),
    Stop,
}

/// Transport that records every call and fails on demand
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_speak: AtomicBool,
    fail_voice: AtomicBool,
    fail_stop: AtomicBool,
    voice_delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_speak(&self, fail: bool) {
        self.fail_speak.store(fail, Ordering::SeqCst);
    }

    /// Fail `start_voice` and `stop_voice`
    pub fn fail_voice(&self, fail: bool) {
        self.fail_voice.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Hold `start_voice` and `stop_voice` for `delay` before answering
    pub fn delay_voice(&self, delay: Duration) {
        *self.voice_delay.lock().unwrap() = Some(delay);
    }

    async fn voice_pause(&self) {
        let delay = *self.voice_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn outcome(flag: &AtomicBool, what: &str) -> Result<(), TransportError> {
        if flag.load(Ordering::SeqCst) {
            Err(TransportError::command(format!("{what} failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AvatarTransport for MockTransport {
    async fn speak(&self, text: &str, kind: SpeakKind) -> Result<(), TransportError> {
        self.record(TransportCall::Speak {
            text: text.to_string(),
            kind,
        });
        Self::outcome(&self.fail_speak, "speak")
    }

    async fn start_voice(&self, options: &VoiceOptions) -> Result<(), TransportError> {
        self.record(TransportCall::StartVoice(options.clone()));
        self.voice_pause().await;
        Self::outcome(&self.fail_voice, "start voice")
    }

    async fn stop_voice(&self) -> Result<(), TransportError> {
        self.record(TransportCall::StopVoice);
        self.voice_pause().await;
        Self::outcome(&self.fail_voice, "stop voice")
    }

    async fn set_input_muted(&self, muted: bool) -> Result<(), TransportError> {
        self.record(TransportCall::SetInputMuted(muted));
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Stop);
        Self::outcome(&self.fail_stop, "stop")
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Connector handing out a shared `MockTransport`.
/// Keeps the event sender so tests can play the avatar service.
pub struct MockConnector {
    transport: Arc<MockTransport>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    error: Mutex<Option<TransportError>>,
    delay: Option<Duration>,
    connects: AtomicUsize,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        Self {
            transport,
            events: Mutex::new(None),
            error: Mutex::new(None),
            delay: None,
            connects: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_with(&self, error: TransportError) {
        *self.error.lock().unwrap() = Some(error);
    }

    /// Number of connect calls that reached the connector
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver a transport event as if the avatar service emitted it
    pub async fn emit(&self, event: TransportEvent) {
        let sender = self.events.lock().unwrap().clone();
        sender
            .expect("transport not connected")
            .send(event)
            .await
            .expect("runtime dropped transport events");
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        _credential: &Credential,
        _options: &StartOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn AvatarTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.error.lock().unwrap().clone() {
            return Err(error);
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(self.transport.clone())
    }
}

// ============================================================================
// Mock credential and microphone
// ============================================================================

pub struct MockTokenProvider {
    result: Result<Credential, TransportError>,
}

#[allow(dead_code)]
impl MockTokenProvider {
    pub fn new() -> Self {
        Self {
            result: Ok(Credential::new("test-token")),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(TransportError::credential(message)),
        }
    }
}

impl Default for MockTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn fetch(&self) -> Result<Credential, TransportError> {
        self.result.clone()
    }
}

pub struct MockMicrophone {
    granted: bool,
}

impl MockMicrophone {
    pub fn allow() -> Self {
        Self { granted: true }
    }

    pub fn deny() -> Self {
        Self { granted: false }
    }
}

#[async_trait]
impl MicrophoneProbe for MockMicrophone {
    async fn probe(&self) -> Result<(), TransportError> {
        if self.granted {
            Ok(())
        } else {
            Err(TransportError::permission_denied("Permission denied"))
        }
    }
}

// ============================================================================
// In-Memory Log Store
// ============================================================================

/// In-memory log store for testing
#[derive(Default)]
pub struct InMemoryLogStore {
    sessions: Mutex<HashMap<String, LoggedSession>>,
    messages: Mutex<Vec<LoggedMessage>>,
    fail_inserts: AtomicBool,
    fail_lookups: AtomicBool,
    fail_closes: AtomicBool,
}

#[allow(dead_code)]
impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &str) -> Option<LoggedSession> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn messages_for(&self, session_id: &str) -> Vec<LoggedMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Fail both session and message inserts
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn insert_session(&self, session: &LoggedSession) -> Result<(), String> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err("store unavailable".to_string());
        }
        self.sessions
            .lock()
            .unwrap()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), String> {
        if self.fail_closes.load(Ordering::SeqCst) {
            return Err("store unavailable".to_string());
        }
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.status = SessionStatus::Completed;
            session.end_time = Some(ended_at);
        }
        Ok(())
    }

    async fn find_message(
        &self,
        session_id: &str,
        sender: Sender,
        text: &str,
    ) -> Result<bool, String> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err("store unavailable".to_string());
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.session_id == session_id && m.sender == sender && m.message == text))
    }

    async fn insert_message(&self, message: &LoggedMessage) -> Result<(), String> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err("store unavailable".to_string());
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<LoggedMessage>, String> {
        Ok(self.messages_for(session_id))
    }
}

// ============================================================================
// Manual Clock
// ============================================================================

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Test Runtime Builder
// ============================================================================

/// Helper for building test runtimes with minimal boilerplate
pub struct TestRuntime {
    pub store: Arc<InMemoryLogStore>,
    pub transport: Arc<MockTransport>,
    pub connector: Arc<MockConnector>,
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_rx: broadcast::Receiver<SseEvent>,
    pub snapshot_rx: watch::Receiver<SessionState>,
    _runtime_handle: tokio::task::JoinHandle<()>,
}

impl TestRuntime {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> TestRuntimeBuilder {
        TestRuntimeBuilder::new()
    }
}

pub struct TestRuntimeBuilder {
    console_id: String,
    connect_delay: Option<Duration>,
    greeting_delay: Duration,
    microphone_granted: bool,
    token_error: Option<String>,
    store: Arc<InMemoryLogStore>,
    transport: Arc<MockTransport>,
}

#[allow(dead_code)]
impl TestRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            console_id: "test-console".to_string(),
            connect_delay: None,
            greeting_delay: Duration::from_millis(20),
            microphone_granted: true,
            token_error: None,
            store: Arc::new(InMemoryLogStore::new()),
            transport: Arc::new(MockTransport::new()),
        }
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn greeting_delay(mut self, delay: Duration) -> Self {
        self.greeting_delay = delay;
        self
    }

    pub fn deny_microphone(mut self) -> Self {
        self.microphone_granted = false;
        self
    }

    pub fn token_error(mut self, message: &str) -> Self {
        self.token_error = Some(message.to_string());
        self
    }

    pub fn store(mut self, store: Arc<InMemoryLogStore>) -> Self {
        self.store = store;
        self
    }

    pub fn transport(mut self, transport: Arc<MockTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn build(self) -> TestRuntime {
        let mut connector = MockConnector::new(self.transport.clone());
        if let Some(delay) = self.connect_delay {
            connector = connector.with_delay(delay);
        }
        let connector = Arc::new(connector);

        let tokens: Arc<dyn TokenProvider> = match &self.token_error {
            Some(message) => Arc::new(MockTokenProvider::failing(message)),
            None => Arc::new(MockTokenProvider::new()),
        };
        let microphone: Arc<dyn MicrophoneProbe> = if self.microphone_granted {
            Arc::new(MockMicrophone::allow())
        } else {
            Arc::new(MockMicrophone::deny())
        };

        let context = ConsoleContext::new(&self.console_id, StartOptions::default()).with_delays(
            self.greeting_delay,
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let (event_tx, event_rx) = mpsc::channel(64);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(context.initial_state());

        let session_log = SessionLog::new(self.store.clone(), Arc::new(SystemClock));
        let runtime = SessionRuntime::new(
            context,
            session_log,
            connector.clone(),
            tokens,
            microphone,
            event_rx,
            event_tx.clone(),
            broadcast_tx,
            snapshot_tx,
        );

        let handle = tokio::spawn(async move {
            runtime.run().await;
        });

        TestRuntime {
            store: self.store,
            transport: self.transport,
            connector,
            event_tx,
            broadcast_rx,
            snapshot_rx,
            _runtime_handle: handle,
        }
    }
}

impl Default for TestRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRuntime {
    pub async fn send(&self, event: Event) {
        self.event_tx.send(event).await.expect("Failed to send event");
    }

    pub fn state(&self) -> SessionState {
        self.snapshot_rx.borrow().clone()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Option<SessionState> {
        match tokio::time::timeout(timeout, self.snapshot_rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Some(state.clone()),
            _ => None,
        }
    }

    pub async fn wait_for_phase(&mut self, phase: Phase, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| s.phase == phase).await.is_some()
    }

    /// Start a session and wait until it is live
    pub async fn start_live(&mut self) -> SessionState {
        self.send(Event::Start).await;
        self.wait_for(Duration::from_secs(2), |s| s.phase == Phase::Live)
            .await
            .expect("session did not go live")
    }

    /// Poll `check` until it holds or the timeout passes
    pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Mode;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_mock_transport_records_calls() {
        let transport = MockTransport::new();
        transport.speak("Hallo", SpeakKind::Talk).await.unwrap();
        transport.fail_stop(true);
        assert!(transport.stop().await.is_err());
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Speak {
                    text: "Hallo".to_string(),
                    kind: SpeakKind::Talk
                },
                TransportCall::Stop
            ]
        );
    }

    /// Typed message followed by a two-part avatar reply
    #[tokio::test]
    async fn test_hallo_welkom_scenario() {
        let mut rt = TestRuntime::new().build();
        let live = rt.start_live().await;
        let log_id = live.log_session_id.clone().expect("log session opened");

        rt.send(Event::SendText {
            text: "Hallo".to_string(),
        })
        .await;
        rt.connector
            .emit(TransportEvent::AvatarFragment {
                text: "Welkom! Ho".to_string(),
            })
            .await;
        rt.connector
            .emit(TransportEvent::AvatarFragment {
                text: "e kan ik helpen?".to_string(),
            })
            .await;

        let state = rt
            .wait_for(WAIT, |s| s.transcript.len() == 3)
            .await
            .expect("three transcript entries");
        let texts: Vec<_> = state.transcript.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["Hallo", "Welkom!", "Hoe kan ik helpen?"]);
        assert_eq!(state.transcript[0].sender, Sender::User);
        assert_eq!(state.transcript[1].sender, Sender::Avatar);
        assert_eq!(state.assembler.pending(), "");

        let store = rt.store.clone();
        assert!(TestRuntime::eventually(WAIT, || store.messages_for(&log_id).len() == 3).await);
        let logged: Vec<_> = store
            .messages_for(&log_id)
            .into_iter()
            .map(|m| (m.sender, m.message))
            .collect();
        assert_eq!(
            logged,
            vec![
                (Sender::User, "Hallo".to_string()),
                (Sender::Avatar, "Welkom!".to_string()),
                (Sender::Avatar, "Hoe kan ik helpen?".to_string()),
            ]
        );

        assert!(rt.transport.calls().contains(&TransportCall::Speak {
            text: "Hallo".to_string(),
            kind: SpeakKind::Talk,
        }));
    }

    #[tokio::test]
    async fn test_greeting_spoken_but_never_logged() {
        let mut rt = TestRuntime::new().build();
        let live = rt.start_live().await;
        let log_id = live.log_session_id.clone().unwrap();

        let transport = rt.transport.clone();
        assert!(
            TestRuntime::eventually(WAIT, || transport.calls().contains(&TransportCall::Speak {
                text: "Hoi".to_string(),
                kind: SpeakKind::Greeting,
            }))
            .await
        );

        // Warm-up starts voice chat muted without leaving text mode
        assert!(
            TestRuntime::eventually(WAIT, || transport
                .calls()
                .contains(&TransportCall::StartVoice(VoiceOptions::warm_up())))
            .await
        );

        rt.connector
            .emit(TransportEvent::AvatarFragment {
                text: "Hoi!".to_string(),
            })
            .await;
        rt.send(Event::SendText {
            text: "Dag".to_string(),
        })
        .await;
        let state = rt.wait_for(WAIT, |s| !s.transcript.is_empty()).await.unwrap();
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.mode, Mode::Text);

        let store = rt.store.clone();
        assert!(TestRuntime::eventually(WAIT, || store.messages_for(&log_id).len() == 1).await);
    }

    #[tokio::test]
    async fn test_end_reaches_idle_despite_failures() {
        let mut rt = TestRuntime::new().build();
        rt.store.fail_closes(true);
        rt.transport.fail_stop(true);
        rt.start_live().await;

        rt.send(Event::End).await;
        let state = rt
            .wait_for(WAIT, |s| s.phase == Phase::Idle)
            .await
            .expect("session reached idle");

        assert!(state.transcript.is_empty());
        assert!(state.log_session_id.is_none());
        assert!(state.media.is_none());
        let diagnostic = state.diagnostic.expect("failures reported");
        assert!(diagnostic.contains("Stop error"));
        assert!(diagnostic.contains("Failed to close session log"));
        assert!(rt.transport.calls().contains(&TransportCall::Stop));
    }

    #[tokio::test]
    async fn test_mic_toggle_in_text_mode_makes_no_transport_call() {
        let mut rt = TestRuntime::new().build();
        rt.start_live().await;

        rt.send(Event::ToggleMicrophone).await;
        let state = rt.wait_for(WAIT, |s| s.mic_open).await.unwrap();
        assert_eq!(state.status.map(|s| s.text), Some("Microfoon aan".to_string()));

        // Status clears itself
        assert!(rt.wait_for(WAIT, |s| s.status.is_none()).await.is_some());
        assert!(!rt
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::SetInputMuted(_))));
    }

    #[tokio::test]
    async fn test_voice_mode_gates_spoken_input() {
        let mut rt = TestRuntime::new().build();
        rt.start_live().await;

        rt.send(Event::SetMode { mode: Mode::Voice }).await;
        assert!(rt.wait_for(WAIT, |s| s.mode == Mode::Voice).await.is_some());
        assert!(rt
            .transport
            .calls()
            .contains(&TransportCall::StartVoice(VoiceOptions::conversational())));

        rt.connector
            .emit(TransportEvent::UserFragment {
                text: "niet gehoord".to_string(),
            })
            .await;
        // Transport events are forwarded in order; media showing up means the
        // fragment before it was processed with the gate closed
        rt.connector
            .emit(TransportEvent::StreamReady {
                media: MediaHandle::new("stream-1"),
            })
            .await;
        assert!(rt.wait_for(WAIT, |s| s.media.is_some()).await.is_some());

        rt.send(Event::ToggleMicrophone).await;
        assert!(rt.wait_for(WAIT, |s| s.mic_open).await.is_some());
        rt.connector
            .emit(TransportEvent::UserFragment {
                text: "wel gehoord".to_string(),
            })
            .await;

        let state = rt.wait_for(WAIT, |s| !s.transcript.is_empty()).await.unwrap();
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.transcript[0].text, "wel gehoord");

        let transport = rt.transport.clone();
        assert!(
            TestRuntime::eventually(WAIT, || transport
                .calls()
                .contains(&TransportCall::SetInputMuted(false)))
            .await
        );
    }

    #[tokio::test]
    async fn test_failed_mode_switch_keeps_text_mode() {
        let mut rt = TestRuntime::new().build();
        rt.start_live().await;
        // Let the warm-up call settle before voice calls start failing
        let transport = rt.transport.clone();
        assert!(
            TestRuntime::eventually(WAIT, || transport
                .calls()
                .iter()
                .any(|c| matches!(c, TransportCall::StartVoice(_))))
            .await
        );
        rt.transport.fail_voice(true);

        rt.send(Event::SetMode { mode: Mode::Voice }).await;
        let state = rt
            .wait_for(WAIT, |s| {
                s.diagnostic
                    .as_deref()
                    .is_some_and(|d| d.starts_with("Mode change error"))
            })
            .await
            .unwrap();
        assert_eq!(state.mode, Mode::Text);
    }

    #[tokio::test]
    async fn test_permission_denied_never_connects() {
        let mut rt = TestRuntime::new().deny_microphone().build();
        rt.send(Event::Start).await;

        let state = rt
            .wait_for(WAIT, |s| s.phase == Phase::Idle && s.diagnostic.is_some())
            .await
            .expect("start failed");
        assert_eq!(
            state.diagnostic.as_deref(),
            Some("Microphone access denied. Check browser settings.")
        );
        assert_eq!(rt.connector.connect_count(), 0);
        assert!(rt.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_token_failure_reports_session_error() {
        let mut rt = TestRuntime::new().token_error("endpoint down").build();
        rt.send(Event::Start).await;

        let state = rt
            .wait_for(WAIT, |s| s.phase == Phase::Idle && s.diagnostic.is_some())
            .await
            .unwrap();
        assert_eq!(state.diagnostic.as_deref(), Some("Session error: endpoint down"));
    }

    #[tokio::test]
    async fn test_end_during_connecting_stops_late_transport() {
        let mut rt = TestRuntime::new()
            .connect_delay(Duration::from_millis(200))
            .build();
        rt.send(Event::Start).await;
        assert!(rt.wait_for_phase(Phase::Connecting, WAIT).await);

        rt.send(Event::End).await;
        assert!(rt.wait_for_phase(Phase::Idle, WAIT).await);

        // The connect still completes on the page side and is stopped
        let transport = rt.transport.clone();
        assert!(TestRuntime::eventually(WAIT, || transport.calls() == vec![TransportCall::Stop]).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = rt.state();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.diagnostic.is_none());
        assert_eq!(rt.transport.calls(), vec![TransportCall::Stop]);
    }

    #[tokio::test]
    async fn test_restart_speaks_greeting_once() {
        let mut rt = TestRuntime::new()
            .greeting_delay(Duration::from_millis(200))
            .build();
        rt.start_live().await;
        rt.send(Event::End).await;
        assert!(rt.wait_for_phase(Phase::Idle, WAIT).await);
        rt.start_live().await;

        let transport = rt.transport.clone();
        let greetings = move || {
            transport
                .calls()
                .iter()
                .filter(|c| matches!(c, TransportCall::Speak { kind: SpeakKind::Greeting, .. }))
                .count()
        };
        assert!(TestRuntime::eventually(WAIT, || greetings() == 1).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(greetings(), 1);
    }

    #[tokio::test]
    async fn test_mode_switch_of_ended_session_is_dropped() {
        let mut rt = TestRuntime::new().build();
        rt.transport.delay_voice(Duration::from_millis(200));
        rt.start_live().await;

        rt.send(Event::SetMode { mode: Mode::Voice }).await;
        let transport = rt.transport.clone();
        assert!(
            TestRuntime::eventually(WAIT, || transport
                .calls()
                .contains(&TransportCall::StartVoice(VoiceOptions::conversational())))
            .await
        );
        rt.send(Event::End).await;
        assert!(rt.wait_for_phase(Phase::Idle, WAIT).await);
        rt.start_live().await;

        // Outlast the pending voice start of the first session
        tokio::time::sleep(Duration::from_millis(400)).await;
        let state = rt.state();
        assert_eq!(state.phase, Phase::Live);
        assert_eq!(state.mode, Mode::Text);
    }

    #[tokio::test]
    async fn test_stream_disconnect_ends_session() {
        let mut rt = TestRuntime::new().build();
        rt.start_live().await;
        rt.connector
            .emit(TransportEvent::StreamReady {
                media: MediaHandle::new("stream-1"),
            })
            .await;
        assert!(rt.wait_for(WAIT, |s| s.media.is_some()).await.is_some());

        rt.connector.emit(TransportEvent::StreamDisconnected).await;
        let state = rt.wait_for(WAIT, |s| s.phase == Phase::Idle).await.unwrap();
        assert!(state.media.is_none());
    }

    #[tokio::test]
    async fn test_speak_failure_keeps_optimistic_message() {
        let mut rt = TestRuntime::new().build();
        rt.transport.fail_speak(true);
        rt.start_live().await;

        rt.send(Event::SendText {
            text: "Hallo".to_string(),
        })
        .await;
        let state = rt
            .wait_for(WAIT, |s| {
                s.diagnostic
                    .as_deref()
                    .is_some_and(|d| d.starts_with("Speak error"))
            })
            .await
            .unwrap();
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.transcript[0].text, "Hallo");
    }

    #[tokio::test]
    async fn test_store_outage_does_not_block_conversation() {
        let store = Arc::new(InMemoryLogStore::new());
        store.fail_inserts(true);
        let mut rt = TestRuntime::new().store(store).build();
        let live = rt.start_live().await;
        assert!(live.log_session_id.is_none());

        rt.send(Event::SendText {
            text: "Hallo".to_string(),
        })
        .await;
        let state = rt.wait_for(WAIT, |s| s.transcript.len() == 1).await.unwrap();
        assert_eq!(state.phase, Phase::Live);
    }

    #[tokio::test]
    async fn test_intent_while_idle_reports_error_or_toast() {
        let mut rt = TestRuntime::new().build();
        rt.send(Event::SendText {
            text: "Hallo".to_string(),
        })
        .await;
        let state = rt.wait_for(WAIT, |s| s.status.is_some()).await.unwrap();
        assert_eq!(
            state.status.map(|s| s.text),
            Some("Start eerst een gesprek".to_string())
        );

        rt.start_live().await;
        rt.send(Event::Start).await;
        let error = loop {
            match tokio::time::timeout(WAIT, rt.broadcast_rx.recv()).await {
                Ok(Ok(SseEvent::Error { message })) => break message,
                Ok(Ok(_) | Err(broadcast::error::RecvError::Lagged(_))) => {}
                _ => panic!("no error event"),
            }
        };
        assert_eq!(error, "A session is already running");
    }
}
