//! Wire format between the server and the avatar page

use crate::runtime::traits::{SpeakKind, StartOptions, TransportEvent, VoiceOptions};
use serde::{Deserialize, Serialize};

/// Command sent to the page hosting the avatar SDK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RelayCommand {
    Connect { token: String, options: StartOptions },
    ProbeMicrophone,
    Speak { text: String, kind: SpeakKind },
    StartVoice { options: VoiceOptions },
    StopVoice,
    SetInputMuted { muted: bool },
    Stop,
}

impl RelayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RelayCommand::Connect { .. } => "connect",
            RelayCommand::ProbeMicrophone => "probe_microphone",
            RelayCommand::Speak { .. } => "speak",
            RelayCommand::StartVoice { .. } => "start_voice",
            RelayCommand::StopVoice => "stop_voice",
            RelayCommand::SetInputMuted { .. } => "set_input_muted",
            RelayCommand::Stop => "stop",
        }
    }
}

/// Outgoing frame: a command tagged with a request id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: u64,
    #[serde(flatten)]
    pub command: RelayCommand,
}

/// Incoming frame from the page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Outcome of a command
    Reply {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// SDK event forwarded as is
    Event { event: TransportEvent },
}
