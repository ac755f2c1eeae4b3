//! Runtime events emitted by the pipeline for UI and observability.
//!
//! Events are small and cloneable so the frame thread and the pipeline
//! workers can emit them without blocking.

use crate::conversation::ConversationState;
use crate::error::Stage;
use crate::pipeline::messages::EndpointReason;
use crate::profiling::ProfileReport;
use tokio::sync::broadcast;

/// Events that describe what the assistant is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// The conversation moved between states.
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    /// Text recognized so far in the live utterance.
    PartialTranscript(String),
    /// The finalized utterance.
    FinalTranscript(String),
    /// A generated text fragment handed to synthesis.
    Token(String),
    /// A generation run finished.
    Completion {
        text: String,
        reason: EndpointReason,
    },
    /// A stage failed; the conversation was reset.
    Error { stage: Stage, message: String },
    /// Per-run throughput and latency numbers.
    Profile(ProfileReport),
}

/// Cheap cloneable handle for emitting [`RuntimeEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<broadcast::Sender<RuntimeEvent>>);

impl EventSink {
    pub fn new(tx: broadcast::Sender<RuntimeEvent>) -> Self {
        Self(Some(tx))
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Emit without blocking. Having no subscribers is not an error.
    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
