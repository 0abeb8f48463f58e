//! Transcript assembly
//!
//! Turns the incremental text fragments emitted by the avatar transport into
//! complete transcript messages.

use crate::state_machine::state::Mode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters that close a sentence
pub const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Avatar,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Avatar => "avatar",
        }
    }

    /// Parse a stored sender. `ai` is the legacy spelling of `avatar`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Sender::User),
            "avatar" | "ai" => Some(Sender::Avatar),
            _ => None,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed transcript entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub sender: Sender,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::User,
            session_id: None,
        }
    }

    pub fn avatar(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::Avatar,
            session_id: None,
        }
    }

    #[must_use]
    pub fn in_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(String::from);
        self
    }
}

/// Segments avatar speech into sentences and filters user input.
///
/// Holds the pending (not yet terminated) avatar text and the user utterance
/// that immediately precedes it in the transcript, which drives
/// consecutive-duplicate suppression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptAssembler {
    greeting: String,
    pending: String,
    last_user_text: Option<String>,
}

impl TranscriptAssembler {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            pending: String::new(),
            last_user_text: None,
        }
    }

    /// Text received from the avatar that has no terminator yet
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Feed an avatar fragment, returning every sentence it completes.
    pub fn ingest_avatar_fragment(&mut self, raw: &str) -> Vec<Message> {
        if raw.trim().is_empty() || self.is_greeting(raw) {
            return Vec::new();
        }

        self.pending.push_str(raw);
        let (sentences, rest) = split_sentences(&self.pending);
        self.pending = rest;

        let messages: Vec<Message> = sentences
            .into_iter()
            .filter(|sentence| !self.is_greeting(sentence))
            .map(Message::avatar)
            .collect();
        // An avatar turn in between means the next user message is no repeat
        if !messages.is_empty() {
            self.last_user_text = None;
        }
        messages
    }

    /// Feed a user utterance, applying the microphone gate and duplicate
    /// suppression.
    pub fn ingest_user_fragment(
        &mut self,
        raw: &str,
        mode: Mode,
        mic_open: bool,
    ) -> Option<Message> {
        if raw.trim().is_empty() {
            return None;
        }
        if mode == Mode::Voice && !mic_open {
            return None;
        }
        if self.last_user_text.as_deref() == Some(raw) {
            return None;
        }
        self.last_user_text = Some(raw.to_string());
        Some(Message::user(raw))
    }

    /// Record a user message committed outside the transport (typed text),
    /// so the transport's echo of it is treated as a duplicate.
    pub fn note_user_message(&mut self, text: &str) {
        self.last_user_text = Some(text.to_string());
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_user_text = None;
    }

    fn is_greeting(&self, text: &str) -> bool {
        !self.greeting.is_empty() && text.contains(self.greeting.as_str())
    }
}

/// Split `buffer` into completed sentences and the unterminated remainder.
///
/// A sentence is a run of non-terminators followed by one or more
/// terminators. Sentences are trimmed; a terminator run with no text in
/// front of it is discarded rather than kept in the remainder.
pub fn split_sentences(buffer: &str) -> (Vec<String>, String) {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut in_terminators = false;

    for ch in buffer.chars() {
        let is_terminator = SENTENCE_TERMINATORS.contains(&ch);
        if in_terminators && !is_terminator {
            push_sentence(&mut sentences, &current);
            current.clear();
            in_terminators = false;
        }
        current.push(ch);
        if is_terminator {
            in_terminators = true;
        }
    }

    if in_terminators {
        push_sentence(&mut sentences, &current);
        current.clear();
    }

    (sentences, current)
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    let has_body = trimmed
        .chars()
        .any(|c| !SENTENCE_TERMINATORS.contains(&c) && !c.is_whitespace());
    if has_body {
        sentences.push(trimmed.to_string());
    }
}
