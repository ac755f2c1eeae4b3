//! Error types for the parley pipeline.

use std::fmt;

/// The pipeline component an error or event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Wake word detection on the frame thread.
    WakeWord,
    /// Streaming transcription on the frame thread.
    Transcription,
    /// Language model generation.
    Generation,
    /// Text-to-speech synthesis.
    Synthesis,
    /// Audio output.
    Playback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WakeWord => "wake word",
            Self::Transcription => "transcription",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
            Self::Playback => "playback",
        };
        f.write_str(name)
    }
}

/// Top-level error type for the assistant.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// An engine could not be initialized. Fatal to the load attempt.
    #[error("{stage} engine failed to initialize: {message}")]
    Init {
        /// Engine that failed.
        stage: Stage,
        /// Human-readable cause.
        message: String,
    },

    /// A per-frame or per-token engine call failed.
    #[error("{stage} engine error: {message}")]
    Engine {
        /// Engine that failed.
        stage: Stage,
        /// Human-readable cause.
        message: String,
    },

    /// Audio device or stream error.
    #[error("audio device error: {0}")]
    Device(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl AssistantError {
    /// Shorthand for an [`AssistantError::Engine`] error.
    pub fn engine(stage: Stage, message: impl Into<String>) -> Self {
        Self::Engine {
            stage,
            message: message.into(),
        }
    }

    /// Shorthand for an [`AssistantError::Init`] error.
    pub fn init(stage: Stage, message: impl Into<String>) -> Self {
        Self::Init {
            stage,
            message: message.into(),
        }
    }

    /// The stage that raised this error, when it is tied to one.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Init { stage, .. } | Self::Engine { stage, .. } => Some(*stage),
            Self::Device(_) => Some(Stage::Playback),
            _ => None,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
