//! Trait abstractions for runtime I/O
//!
//! The avatar transport, credential endpoint, microphone probe and session
//! log store are all reached through these traits so the runtime can be
//! driven by mock implementations in tests.

use crate::db::{Database, LoggedMessage, LoggedSession};
use crate::transcript::Sender;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// Transport types
// ============================================================================

/// Transport error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::PermissionDenied, message)
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Credential, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connection, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Command, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Microphone access refused
    PermissionDenied,
    /// Access token could not be obtained
    Credential,
    /// Transport could not be established
    Connection,
    /// A command on an established transport failed
    Command,
    /// The transport went away while a command was pending
    Closed,
}

/// Opaque access token for the avatar service
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Opaque reference to the media stream the transport renders into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaHandle(String);

impl MediaHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarQuality {
    Low,
    Medium,
    #[default]
    High,
}

impl AvatarQuality {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Options for starting an avatar stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    pub quality: AvatarQuality,
    pub avatar_name: String,
    pub knowledge_id: Option<String>,
    pub language: String,
    pub disable_idle_timeout: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            quality: AvatarQuality::High,
            avatar_name: String::new(),
            knowledge_id: None,
            language: "nl".to_string(),
            disable_idle_timeout: true,
        }
    }
}

/// Options for voice chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceOptions {
    pub use_silence_prompt: bool,
    pub silence_timeout_ms: Option<u64>,
    pub silence_threshold_db: Option<i32>,
    pub input_muted: bool,
}

impl VoiceOptions {
    /// Voice chat as entered through a mode switch: quick turn-taking
    pub fn conversational() -> Self {
        Self {
            use_silence_prompt: true,
            silence_timeout_ms: Some(100),
            silence_threshold_db: Some(-50),
            input_muted: false,
        }
    }

    /// Voice chat started right after connect, input muted until the gate opens
    pub fn warm_up() -> Self {
        Self {
            use_silence_prompt: true,
            silence_timeout_ms: Some(5000),
            silence_threshold_db: None,
            input_muted: true,
        }
    }
}

/// How the avatar should treat a speak request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakKind {
    /// Answer the text as conversational input
    Talk,
    /// Say the greeting verbatim; not part of the transcript
    Greeting,
}

/// Events emitted by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    StreamReady { media: MediaHandle },
    StreamDisconnected,
    UserFragment { text: String },
    AvatarFragment { text: String },
    UserStart,
    UserStop,
}

// ============================================================================
// Transport traits
// ============================================================================

/// An established avatar stream
#[async_trait]
pub trait AvatarTransport: Send + Sync {
    async fn speak(&self, text: &str, kind: SpeakKind) -> Result<(), TransportError>;

    async fn start_voice(&self, options: &VoiceOptions) -> Result<(), TransportError>;

    async fn stop_voice(&self) -> Result<(), TransportError>;

    /// Enable or disable the outgoing audio track without restarting voice chat
    async fn set_input_muted(&self, muted: bool) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;
}

/// Creates avatar transports
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect and start streaming. Transport events are delivered on `events`
    /// until the transport is stopped.
    async fn connect(
        &self,
        credential: &Credential,
        options: &StartOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn AvatarTransport>, TransportError>;
}

/// Source of access tokens for the avatar service
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch(&self) -> Result<Credential, TransportError>;
}

/// Checks that the user granted microphone access
#[async_trait]
pub trait MicrophoneProbe: Send + Sync {
    async fn probe(&self) -> Result<(), TransportError>;
}

/// Cloneable, debuggable handle to a connected transport
#[derive(Clone)]
pub struct TransportHandle(Arc<dyn AvatarTransport>);

impl TransportHandle {
    pub fn new(transport: Arc<dyn AvatarTransport>) -> Self {
        Self(transport)
    }
}

impl Deref for TransportHandle {
    type Target = dyn AvatarTransport;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportHandle")
    }
}

// ============================================================================
// Session log storage
// ============================================================================

/// Remote sink for session and message records
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert a new session record
    async fn insert_session(&self, session: &LoggedSession) -> Result<(), String>;

    /// Mark the session matching `session_id` completed
    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), String>;

    /// Whether a message with this exact `(session_id, sender, text)` exists
    async fn find_message(&self, session_id: &str, sender: Sender, text: &str)
        -> Result<bool, String>;

    async fn insert_message(&self, message: &LoggedMessage) -> Result<(), String>;

    /// All messages of a session in insertion order
    async fn messages(&self, session_id: &str) -> Result<Vec<LoggedMessage>, String>;
}

/// Wall clock, injectable so session expiry can be tested
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: LogStore + ?Sized> LogStore for Arc<T> {
    async fn insert_session(&self, session: &LoggedSession) -> Result<(), String> {
        (**self).insert_session(session).await
    }

    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), String> {
        (**self).close_session(session_id, ended_at).await
    }

    async fn find_message(
        &self,
        session_id: &str,
        sender: Sender,
        text: &str,
    ) -> Result<bool, String> {
        (**self).find_message(session_id, sender, text).await
    }

    async fn insert_message(&self, message: &LoggedMessage) -> Result<(), String> {
        (**self).insert_message(message).await
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<LoggedMessage>, String> {
        (**self).messages(session_id).await
    }
}

#[async_trait]
impl<T: TransportConnector + ?Sized> TransportConnector for Arc<T> {
    async fn connect(
        &self,
        credential: &Credential,
        options: &StartOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn AvatarTransport>, TransportError> {
        (**self).connect(credential, options, events).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a session log store
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LogStore for DatabaseStorage {
    async fn insert_session(&self, session: &LoggedSession) -> Result<(), String> {
        self.db.insert_session(session).map_err(|e| e.to_string())
    }

    async fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), String> {
        self.db
            .close_session(session_id, ended_at)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn find_message(
        &self,
        session_id: &str,
        sender: Sender,
        text: &str,
    ) -> Result<bool, String> {
        self.db
            .message_exists(session_id, sender, text)
            .map_err(|e| e.to_string())
    }

    async fn insert_message(&self, message: &LoggedMessage) -> Result<(), String> {
        self.db.insert_message(message).map_err(|e| e.to_string())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<LoggedMessage>, String> {
        self.db.list_messages(session_id).map_err(|e| e.to_string())
    }
}
