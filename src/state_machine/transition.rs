//! Pure state transition function
//!
//! Given the same state, context and event this always yields the same new
//! state and effects; all I/O happens in the runtime.

use super::state::{ConsoleContext, ErrorKind, Mode, Phase, SessionState};
use super::{Effect, Event};
use crate::runtime::traits::{SpeakKind, VoiceOptions};
use crate::transcript::{Message, Sender};
use thiserror::Error;

pub const STATUS_MIC_ON: &str = "Microfoon aan";
pub const STATUS_MIC_OFF: &str = "Microfoon uit";
pub const STATUS_START_FIRST: &str = "Start eerst een gesprek";

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Intents that are not valid in the current phase
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("A session is already running")]
    AlreadyActive,
    #[error("No live session")]
    NotLive,
    #[error("Switch to text mode to type a message")]
    TextInputDisabled,
}

/// Pure transition function
#[allow(clippy::too_many_lines)] // One arm per (phase, event) pair
pub fn transition(
    state: &SessionState,
    context: &ConsoleContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let mut next = state.clone();

    match (state.phase, event) {
        // ============================================================
        // Start
        // ============================================================
        (Phase::Idle, Event::Start) => {
            next.phase = Phase::Connecting;
            next.diagnostic = None;
            next.generation = state.generation.wrapping_add(1);
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PublishState)
                .with_effect(Effect::Connect)
                .with_effect(Effect::OpenLog))
        }

        (_, Event::Start) => Err(TransitionError::AlreadyActive),

        (Phase::Connecting, Event::Connected { transport }) => {
            next.phase = Phase::Live;
            next.mode = Mode::Text;
            next.mic_open = false;
            Ok(TransitionResult::new(next)
                .with_effect(Effect::AttachTransport { transport })
                .with_effect(Effect::PublishState)
                .with_effect(Effect::ScheduleGreeting {
                    delay: context.greeting_delay,
                    generation: state.generation,
                })
                .with_effect(Effect::ScheduleWarmup {
                    delay: context.warmup_delay,
                    generation: state.generation,
                }))
        }

        // Connect finished after the session was ended: stop the late transport
        (_, Event::Connected { transport }) => {
            Ok(TransitionResult::new(next).with_effect(Effect::ReleaseTransport { transport }))
        }

        (Phase::Connecting, Event::ConnectFailed { error_kind, message }) => {
            let diagnostic = match error_kind {
                ErrorKind::PermissionDenied => {
                    "Microphone access denied. Check browser settings.".to_string()
                }
                _ => format!("Session error: {message}"),
            };
            let mut next = next.reset();
            next.diagnostic = Some(diagnostic.clone());
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PublishState)
                .with_effect(Effect::notify_diagnostic(&diagnostic)))
        }

        (_, Event::ConnectFailed { .. }) => Ok(TransitionResult::new(next)),

        // ============================================================
        // Session log bookkeeping
        // ============================================================
        (phase, Event::LogOpened { session_id: Some(id) }) if phase.is_active() => {
            next.log_session_id = Some(id);
            Ok(TransitionResult::new(next).with_effect(Effect::PublishState))
        }

        (_, Event::LogOpened { .. }) => Ok(TransitionResult::new(next)),

        (phase, Event::LogSessionChanged { session_id }) if phase.is_active() => {
            next.log_session_id = Some(session_id);
            Ok(TransitionResult::new(next).with_effect(Effect::PublishState))
        }

        (_, Event::LogSessionChanged { .. }) => Ok(TransitionResult::new(next)),

        // ============================================================
        // Scheduled greeting and warm-up
        // ============================================================
        (Phase::Live, Event::GreetingDue { generation }) if generation == state.generation => {
            let text = context.greeting.clone();
            Ok(TransitionResult::new(next).with_effect(Effect::Speak {
                text,
                kind: SpeakKind::Greeting,
            }))
        }

        (Phase::Live, Event::WarmupDue { generation }) if generation == state.generation => {
            Ok(TransitionResult::new(next).with_effect(Effect::WarmUpVoice {
                options: VoiceOptions::warm_up(),
            }))
        }

        (_, Event::GreetingDue { .. } | Event::WarmupDue { .. }) => Ok(TransitionResult::new(next)),

        // ============================================================
        // Typed input
        // ============================================================
        (Phase::Idle, Event::SendText { .. } | Event::SetMode { .. } | Event::ToggleMicrophone) => {
            let seq = next.show_status(STATUS_START_FIRST);
            Ok(TransitionResult::new(next)
                .with_effect(Effect::notify_status(Some(STATUS_START_FIRST)))
                .with_effect(Effect::ScheduleStatusClear {
                    seq,
                    delay: context.status_clear_delay,
                }))
        }

        (Phase::Live, Event::SendText { text }) => {
            if state.mode != Mode::Text {
                return Err(TransitionError::TextInputDisabled);
            }
            let text = text.trim().to_string();
            if text.is_empty() {
                return Ok(TransitionResult::new(next));
            }

            // Committed before the transport acknowledges; never rolled back.
            // Typing the previous message again still speaks it but keeps one entry.
            let repeated = state
                .transcript
                .last()
                .is_some_and(|last| last.sender == Sender::User && last.text == text);
            next.assembler.note_user_message(&text);
            let mut effects = Vec::with_capacity(3);
            if !repeated {
                let message =
                    Message::user(text.clone()).in_session(state.log_session_id.as_deref());
                effects.extend(Effect::commit_message(&message));
                next.transcript.push(message);
            }
            effects.push(Effect::Speak {
                text,
                kind: SpeakKind::Talk,
            });
            Ok(TransitionResult::new(next).with_effects(effects))
        }

        (_, Event::SendText { .. }) => Err(TransitionError::NotLive),

        // ============================================================
        // Mode switching
        // ============================================================
        (Phase::Live, Event::SetMode { mode }) => {
            if mode == state.mode {
                return Ok(TransitionResult::new(next));
            }
            let effect = match mode {
                Mode::Voice => Effect::StartVoice {
                    options: VoiceOptions::conversational(),
                    generation: state.generation,
                },
                Mode::Text => Effect::StopVoice {
                    generation: state.generation,
                },
            };
            Ok(TransitionResult::new(next).with_effect(effect))
        }

        (_, Event::SetMode { .. }) => Err(TransitionError::NotLive),

        (Phase::Live, Event::ModeSwitched { mode, generation }) if generation == state.generation => {
            next.mode = mode;
            Ok(TransitionResult::new(next).with_effect(Effect::PublishState))
        }

        (Phase::Live, Event::ModeSwitchFailed { message, generation, .. })
            if generation == state.generation =>
        {
            let diagnostic = format!("Mode change error: {message}");
            next.diagnostic = Some(diagnostic.clone());
            Ok(TransitionResult::new(next).with_effect(Effect::notify_diagnostic(&diagnostic)))
        }

        (_, Event::ModeSwitched { .. } | Event::ModeSwitchFailed { .. }) => {
            Ok(TransitionResult::new(next))
        }

        // ============================================================
        // Microphone gate
        // ============================================================
        (_, Event::ToggleMicrophone) => {
            next.mic_open = !state.mic_open;
            let text = if next.mic_open {
                STATUS_MIC_ON
            } else {
                STATUS_MIC_OFF
            };
            let seq = next.show_status(text);
            let mut result = TransitionResult::new(next);
            // Cheap path: toggle the audio track, voice chat keeps running
            if state.phase == Phase::Live && state.mode == Mode::Voice {
                result = result.with_effect(Effect::SetInputMuted {
                    muted: state.mic_open,
                });
            }
            Ok(result
                .with_effect(Effect::PublishState)
                .with_effect(Effect::notify_status(Some(text)))
                .with_effect(Effect::ScheduleStatusClear {
                    seq,
                    delay: context.status_clear_delay,
                }))
        }

        (_, Event::StatusExpired { seq }) => {
            if state.status.as_ref().is_some_and(|s| s.seq == seq) {
                next.status = None;
                Ok(TransitionResult::new(next).with_effect(Effect::notify_status(None)))
            } else {
                Ok(TransitionResult::new(next))
            }
        }

        // ============================================================
        // Transport event routing
        // ============================================================
        (phase, Event::StreamReady { media }) if phase.is_active() => {
            next.media = Some(media);
            Ok(TransitionResult::new(next).with_effect(Effect::PublishState))
        }

        (phase, Event::UserFragment { text }) if phase.is_active() => {
            match next
                .assembler
                .ingest_user_fragment(&text, state.mode, state.mic_open)
            {
                Some(message) => {
                    let message = message.in_session(state.log_session_id.as_deref());
                    next.transcript.push(message.clone());
                    Ok(TransitionResult::new(next).with_effects(Effect::commit_message(&message)))
                }
                None => Ok(TransitionResult::new(next)),
            }
        }

        (phase, Event::AvatarFragment { text }) if phase.is_active() => {
            let sentences = next.assembler.ingest_avatar_fragment(&text);
            let mut effects = Vec::with_capacity(sentences.len() * 2);
            for sentence in sentences {
                // The avatar repeating its previous sentence is kept once
                let repeated = next
                    .transcript
                    .last()
                    .is_some_and(|last| last.sender == Sender::Avatar && last.text == sentence.text);
                if repeated {
                    continue;
                }
                let message = sentence.in_session(state.log_session_id.as_deref());
                effects.extend(Effect::commit_message(&message));
                next.transcript.push(message);
            }
            Ok(TransitionResult::new(next).with_effects(effects))
        }

        (phase, Event::UserStart) if phase.is_active() => {
            next.user_talking = true;
            Ok(TransitionResult::new(next).with_effect(Effect::notify_user_talking(true)))
        }

        (phase, Event::UserStop) if phase.is_active() => {
            next.user_talking = false;
            Ok(TransitionResult::new(next).with_effect(Effect::notify_user_talking(false)))
        }

        // Stale transport events after teardown
        (
            _,
            Event::StreamReady { .. }
            | Event::UserFragment { .. }
            | Event::AvatarFragment { .. }
            | Event::UserStart
            | Event::UserStop,
        ) => Ok(TransitionResult::new(next)),

        // ============================================================
        // Fire-and-forget failures
        // ============================================================
        (_, Event::TransportWarning { message }) => {
            next.diagnostic = Some(message.clone());
            Ok(TransitionResult::new(next).with_effect(Effect::notify_diagnostic(&message)))
        }

        // ============================================================
        // Ending
        // ============================================================
        (Phase::Connecting | Phase::Live, Event::End | Event::StreamDisconnected) => {
            next.phase = Phase::Ending;
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PublishState)
                .with_effect(Effect::Teardown {
                    log_session_id: state.log_session_id.clone(),
                    stop_voice: state.mode == Mode::Voice,
                }))
        }

        // Idempotent: nothing left to end
        (Phase::Idle | Phase::Ending, Event::End | Event::StreamDisconnected) => {
            Ok(TransitionResult::new(next))
        }

        (Phase::Ending, Event::TeardownComplete { failures }) => {
            let mut next = next.reset();
            let mut effects = vec![Effect::PublishState];
            if !failures.is_empty() {
                let diagnostic = failures.join("; ");
                effects.push(Effect::notify_diagnostic(&diagnostic));
                next.diagnostic = Some(diagnostic);
            }
            Ok(TransitionResult::new(next).with_effects(effects))
        }

        (_, Event::TeardownComplete { .. }) => Ok(TransitionResult::new(next)),
    }
}
