//! Events that drive the session controller

use super::state::{ErrorKind, Mode};
use crate::runtime::traits::{MediaHandle, TransportEvent, TransportHandle};

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User intents
    Start,
    SendText {
        text: String,
    },
    SetMode {
        mode: Mode,
    },
    ToggleMicrophone,
    End,

    // Transport events
    StreamReady {
        media: MediaHandle,
    },
    StreamDisconnected,
    UserFragment {
        text: String,
    },
    AvatarFragment {
        text: String,
    },
    UserStart,
    UserStop,

    // Effect outcomes
    Connected {
        transport: TransportHandle,
    },
    ConnectFailed {
        error_kind: ErrorKind,
        message: String,
    },
    LogOpened {
        session_id: Option<String>,
    },
    /// The session log replaced an expired session
    LogSessionChanged {
        session_id: String,
    },
    ModeSwitched {
        mode: Mode,
        generation: u64,
    },
    ModeSwitchFailed {
        mode: Mode,
        message: String,
        generation: u64,
    },
    /// Fire-and-forget transport call failed (speak, greeting, warm-up, mute)
    TransportWarning {
        message: String,
    },
    TeardownComplete {
        failures: Vec<String>,
    },

    // Timers, tagged with the connection they were scheduled for
    GreetingDue {
        generation: u64,
    },
    WarmupDue {
        generation: u64,
    },
    StatusExpired {
        seq: u64,
    },
}

impl From<TransportEvent> for Event {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::StreamReady { media } => Event::StreamReady { media },
            TransportEvent::StreamDisconnected => Event::StreamDisconnected,
            TransportEvent::UserFragment { text } => Event::UserFragment { text },
            TransportEvent::AvatarFragment { text } => Event::AvatarFragment { text },
            TransportEvent::UserStart => Event::UserStart,
            TransportEvent::UserStop => Event::UserStop,
        }
    }
}
