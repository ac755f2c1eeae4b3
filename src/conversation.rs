//! Conversation state machine.
//!
//! The transition table lives in the pure [`next_state`] function; the
//! [`ConversationStateMachine`] applies it atomically so that concurrent
//! events from the frame thread and the pipeline workers are serialized
//! without a lock.

use crate::runtime::{EventSink, RuntimeEvent};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

/// Which stage currently owns the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConversationState {
    /// Nothing loaded.
    Idle = 0,
    /// Engines are being initialized.
    LoadingModel = 1,
    /// Waiting for the wake word.
    Listening = 2,
    /// Feeding frames to the transcriber.
    Transcribing = 3,
    /// A pipeline run is generating and speaking.
    Generating = 4,
}

impl ConversationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::LoadingModel,
            2 => Self::Listening,
            3 => Self::Transcribing,
            4 => Self::Generating,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LoadingModel => "loading",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Generating => "generating",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    BeginLoad,
    Loaded,
    LoadFailed,
    WakeWord,
    Endpoint,
    Completed { interrupted: bool },
    EngineError,
    Shutdown,
}

/// The transition table. `None` means the event does not apply in `current`.
#[must_use]
pub fn next_state(current: ConversationState, event: StateEvent) -> Option<ConversationState> {
    use ConversationState as S;
    use StateEvent as E;

    match (current, event) {
        (_, E::Shutdown) if current != S::Idle => Some(S::Idle),
        (S::Idle, E::BeginLoad) => Some(S::LoadingModel),
        (S::LoadingModel, E::Loaded) => Some(S::Listening),
        (S::LoadingModel, E::LoadFailed | E::EngineError) => Some(S::Idle),
        (S::Listening, E::WakeWord) => Some(S::Transcribing),
        (S::Transcribing, E::Endpoint) => Some(S::Generating),
        (S::Generating, E::Completed { interrupted: false }) => Some(S::Listening),
        (S::Generating, E::Completed { interrupted: true }) => Some(S::Transcribing),
        (S::Transcribing | S::Generating, E::EngineError) => Some(S::Listening),
        _ => None,
    }
}

/// A transition that was actually taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConversationState,
    pub to: ConversationState,
}

/// Sole owner of the current [`ConversationState`].
pub struct ConversationStateMachine {
    state: AtomicU8,
    events: EventSink,
}

impl ConversationStateMachine {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: AtomicU8::new(ConversationState::Idle as u8),
            events,
        }
    }

    pub fn current(&self) -> ConversationState {
        ConversationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply `event` atomically. Returns the transition taken, if any.
    pub fn apply(&self, event: StateEvent) -> Option<Transition> {
        let mut current = self.current();
        loop {
            let Some(next) = next_state(current, event) else {
                debug!("{event:?} ignored in state {current}");
                return None;
            };
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    info!("state {current} -> {next} on {event:?}");
                    self.events.emit(RuntimeEvent::StateChanged {
                        from: current,
                        to: next,
                    });
                    return Some(Transition {
                        from: current,
                        to: next,
                    });
                }
                Err(actual) => current = ConversationState::from_u8(actual),
            }
        }
    }
}

/// Text of the utterance being transcribed.
#[derive(Debug, Default)]
pub struct Utterance {
    text: String,
}

impl Utterance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, partial: &str) {
        self.text.push_str(partial);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Freeze the utterance; yields the trimmed text.
    pub fn finalize(self) -> String {
        self.text.trim().to_owned()
    }
}
