//! Parley: an interruptible, streaming voice assistant.
//!
//! Audio frames flow through a cascade:
//! wake word → transcription → generation → synthesis → playback
//!
//! # Architecture
//!
//! - **Frame router**: classifies each captured frame against the
//!   conversation state and feeds the wake-word detector or transcriber.
//! - **Conversation state machine**: five states, changed atomically.
//! - **Streaming pipeline**: generation, synthesis and playback stages
//!   joined by gated single-producer queues.
//! - **Interrupt controller**: a repeated wake word cuts the active
//!   response off mid-sentence and starts a new utterance.
//!
//! Engines sit behind the traits in [`engine`]; the concrete ones talk to
//! OpenAI-compatible HTTP services and to the sound card via `cpal`.

pub mod audio;
pub mod config;
pub mod conversation;
pub mod dialog;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod llm;
pub mod pipeline;
pub mod profiling;
pub mod router;
pub mod runtime;
pub mod startup;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wakeword;

pub use config::AssistantConfig;
pub use conversation::ConversationState;
pub use error::{AssistantError, Result, Stage};
pub use pipeline::PipelineCoordinator;
pub use router::FrameRouter;
pub use runtime::RuntimeEvent;
pub use startup::initialize_engines;
