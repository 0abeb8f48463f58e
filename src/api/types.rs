//! API request and response types

use crate::state_machine::Mode;
use serde::{Deserialize, Serialize};

/// Request to send a typed message
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub text: String,
}

/// Request to switch interaction mode
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: Mode,
}

/// Response for queued console intents
#[derive(Debug, Serialize, Deserialize)]
pub struct QueuedResponse {
    pub queued: bool,
}

/// Logged messages of a session
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionMessagesResponse {
    pub session_id: String,
    pub messages: Vec<serde_json::Value>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
