//! Session controller state types

use crate::runtime::traits::{MediaHandle, StartOptions};
use crate::transcript::{Message, TranscriptAssembler};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Literal the avatar is asked to say on connect; never part of the transcript
pub const DEFAULT_GREETING: &str = "Hoi";

/// Delay between connecting and speaking the greeting
pub const GREETING_DELAY: Duration = Duration::from_millis(1000);

/// Delay between connecting and warming up voice chat
pub const WARMUP_DELAY: Duration = Duration::from_millis(100);

/// How long a transient status notice stays visible
pub const STATUS_CLEAR_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle phase of a console session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No transport, nothing in flight
    #[default]
    Idle,
    /// Credential, microphone probe and connect in flight
    Connecting,
    /// Transport connected, conversation running
    Live,
    /// Teardown in progress
    Ending,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Live => "live",
            Phase::Ending => "ending",
        }
    }

    /// Connecting or Live: transport events are routed into the transcript
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Connecting | Phase::Live)
    }
}

/// Interaction mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "text_mode")]
    Text,
    #[serde(rename = "voice_mode")]
    Voice,
}

/// Error classification for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Microphone probe failed; fatal to start
    PermissionDenied,
    /// Connect, speak or mode switch failed
    TransportFailure,
    /// Session logging failed; never fatal
    StoreUnavailable,
    /// Session log expired lazily
    Timeout,
}

/// Transient, self-clearing status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    pub seq: u64,
    pub text: String,
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub mode: Mode,
    /// Microphone gate; spoken input is dropped in voice mode while closed
    pub mic_open: bool,
    pub transcript: Vec<Message>,
    #[serde(skip)]
    pub assembler: TranscriptAssembler,
    /// Id of the session log the transcript is written to
    pub log_session_id: Option<String>,
    pub media: Option<MediaHandle>,
    pub user_talking: bool,
    pub diagnostic: Option<String>,
    pub status: Option<StatusNotice>,
    #[serde(skip)]
    pub status_seq: u64,
    /// Bumped on every Start; late timer and mode-switch outcomes of an
    /// earlier connection carry a stale value and are dropped
    #[serde(skip)]
    pub generation: u64,
}

impl SessionState {
    pub fn new(greeting: &str) -> Self {
        Self {
            phase: Phase::Idle,
            mode: Mode::Text,
            mic_open: false,
            transcript: Vec::new(),
            assembler: TranscriptAssembler::new(greeting),
            log_session_id: None,
            media: None,
            user_talking: false,
            diagnostic: None,
            status: None,
            status_seq: 0,
            generation: 0,
        }
    }

    /// Back to Idle: drop everything tied to the finished conversation.
    /// Diagnostics and status survive so teardown failures stay visible.
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.phase = Phase::Idle;
        self.mode = Mode::Text;
        self.mic_open = false;
        self.transcript.clear();
        self.assembler.reset();
        self.log_session_id = None;
        self.media = None;
        self.user_talking = false;
        self
    }

    /// Replace the status notice, returning its sequence number
    pub fn show_status(&mut self, text: impl Into<String>) -> u64 {
        self.status_seq += 1;
        self.status = Some(StatusNotice {
            seq: self.status_seq,
            text: text.into(),
        });
        self.status_seq
    }

    /// Typing is accepted only while live in text mode
    pub fn accepts_text(&self) -> bool {
        self.phase == Phase::Live && self.mode == Mode::Text
    }
}

/// Per-console configuration (immutable for the runtime's lifetime)
#[derive(Debug, Clone)]
pub struct ConsoleContext {
    pub console_id: String,
    pub greeting: String,
    pub greeting_delay: Duration,
    pub warmup_delay: Duration,
    pub status_clear_delay: Duration,
    pub start_options: StartOptions,
}

impl ConsoleContext {
    pub fn new(console_id: impl Into<String>, start_options: StartOptions) -> Self {
        Self {
            console_id: console_id.into(),
            greeting: DEFAULT_GREETING.to_string(),
            greeting_delay: GREETING_DELAY,
            warmup_delay: WARMUP_DELAY,
            status_clear_delay: STATUS_CLEAR_DELAY,
            start_options,
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = greeting.into();
        self
    }

    #[must_use]
    pub fn with_delays(mut self, greeting: Duration, warmup: Duration, status_clear: Duration) -> Self {
        self.greeting_delay = greeting;
        self.warmup_delay = warmup;
        self.status_clear_delay = status_clear;
        self
    }

    pub fn initial_state(&self) -> SessionState {
        SessionState::new(&self.greeting)
    }
}
