//! Message types passed between pipeline stages.

use std::fmt;

/// A non-empty unit of generated text that matched no stop phrase.
pub type TokenChunk = String;

/// A non-empty block of 16-bit mono PCM at the synthesizer's native rate.
pub type PcmChunk = Vec<i16>;

/// Why a generation run stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointReason {
    /// The model ended its turn on its own.
    NaturalStop,
    /// The completion token cap was reached.
    TokenLimit,
    /// The model emitted a configured stop phrase.
    StopPhrase,
    /// The run was cancelled by a barge-in or an error elsewhere.
    Interrupted,
}

impl fmt::Display for EndpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NaturalStop => "natural stop",
            Self::TokenLimit => "token limit",
            Self::StopPhrase => "stop phrase",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// The result of one generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Identifier of the run that produced it.
    pub run_id: u64,
    /// Full generated text with stop phrases removed.
    pub text: String,
    /// Why generation ended.
    pub reason: EndpointReason,
    /// Number of token chunks handed to synthesis.
    pub tokens_pushed: usize,
}

impl Completion {
    /// Whether a barge-in cut this completion short.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.reason == EndpointReason::Interrupted
    }
}
