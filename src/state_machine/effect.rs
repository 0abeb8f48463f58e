//! Effects produced by state transitions

use crate::runtime::traits::{SpeakKind, TransportHandle, VoiceOptions};
use crate::transcript::Message;
use serde_json::{json, Value};
use std::time::Duration;

/// Effects to be executed after state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Fetch a credential, probe the microphone and connect (background task)
    Connect,

    /// Keep the handle of a freshly connected transport
    AttachTransport { transport: TransportHandle },

    /// Stop a transport that connected after the session was ended
    ReleaseTransport { transport: TransportHandle },

    /// Open a session log record
    OpenLog,

    /// Append a message to the session log
    LogMessage { message: Message },

    /// Ask the avatar to say something
    Speak { text: String, kind: SpeakKind },

    /// Switch the transport into voice chat
    StartVoice { options: VoiceOptions, generation: u64 },

    /// Leave voice chat
    StopVoice { generation: u64 },

    /// Start voice chat without changing mode; failures only produce a warning
    WarmUpVoice { options: VoiceOptions },

    /// Enable or disable the outgoing audio track
    SetInputMuted { muted: bool },

    /// Close the log, stop voice chat and the transport, each best-effort
    Teardown {
        log_session_id: Option<String>,
        stop_voice: bool,
    },

    ScheduleGreeting { delay: Duration, generation: u64 },
    ScheduleWarmup { delay: Duration, generation: u64 },
    ScheduleStatusClear { seq: u64, delay: Duration },

    /// Broadcast the new state
    PublishState,

    /// Notify connected clients
    NotifyClient { event_type: String, data: Value },
}

impl Effect {
    pub fn notify_message(message: &Message) -> Self {
        Effect::NotifyClient {
            event_type: "message".to_string(),
            data: serde_json::to_value(message).unwrap_or(Value::Null),
        }
    }

    pub fn notify_diagnostic(message: &str) -> Self {
        Effect::NotifyClient {
            event_type: "diagnostic".to_string(),
            data: json!({ "message": message }),
        }
    }

    pub fn notify_status(text: Option<&str>) -> Self {
        Effect::NotifyClient {
            event_type: "status".to_string(),
            data: json!({ "text": text }),
        }
    }

    pub fn notify_user_talking(talking: bool) -> Self {
        Effect::NotifyClient {
            event_type: "user_talking".to_string(),
            data: json!({ "talking": talking }),
        }
    }

    /// Commit a message to the session log and tell clients about it
    pub fn commit_message(message: &Message) -> [Self; 2] {
        [
            Effect::LogMessage {
                message: message.clone(),
            },
            Effect::notify_message(message),
        ]
    }
}
