//! Contracts for the engines the pipeline drives.
//!
//! Engines are opaque frame-in/result-out services. Each one is owned by
//! exactly one stage at a time; release happens through `Drop`.

pub mod scripted;

use crate::audio::PlayState;
use crate::dialog::DialogHistory;
use crate::error::Result;
use crate::pipeline::messages::EndpointReason;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Where a [`Generator`] streams text fragments as they are decoded.
pub type TokenSink = mpsc::UnboundedSender<String>;

/// Spots the configured keyword in fixed-length PCM frames.
pub trait WakeWordDetector: Send {
    /// Returns the index of the matched keyword, if any. Index 0 is the
    /// assistant's wake word.
    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>>;
}

/// A streaming transcription step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptPartial {
    /// Newly recognized text (may be empty).
    pub text: String,
    /// The speaker finished the utterance.
    pub is_endpoint: bool,
}

/// Streaming speech-to-text over fixed-length PCM frames.
pub trait Transcriber: Send {
    fn process(&mut self, frame: &[i16]) -> Result<TranscriptPartial>;

    /// Return any text still held after an endpoint and reset for the next
    /// utterance.
    fn flush(&mut self) -> Result<String>;
}

/// Per-run generation limits.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    /// Maximum number of completion tokens.
    pub token_cap: u32,
    /// Strings that end the model's turn and are never spoken.
    pub stop_phrases: Vec<String>,
}

/// What a generator returns once it stops streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub text: String,
    pub endpoint: EndpointReason,
}

/// Cross-thread "stop generating" signal owned by a [`Generator`].
///
/// Raising it is non-blocking; the generator notices at its next fragment
/// boundary and returns [`EndpointReason::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Reset before each engine call. A run interrupted earlier raises it
    /// again right after.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Streaming language model.
pub trait Generator: Send {
    /// Stream a completion for the dialog, sending each decoded fragment
    /// to `tokens`. Blocks until the completion ends.
    fn generate(
        &mut self,
        dialog: &DialogHistory,
        params: &GenerateParams,
        tokens: &TokenSink,
    ) -> Result<GeneratedText>;

    /// Handle the interrupt controller raises to cut a run short.
    fn interrupt_flag(&self) -> InterruptFlag;
}

/// Streaming text-to-speech.
pub trait Synthesizer: Send + Sync {
    /// Native output rate of every stream, in Hz.
    fn sample_rate(&self) -> u32;

    /// Open a per-utterance stream. Dropping the stream closes it.
    fn open_stream(&self) -> Result<Box<dyn SynthesisStream>>;
}

/// One utterance worth of incremental synthesis.
pub trait SynthesisStream: Send {
    /// Feed a text fragment; returns whatever audio is ready (may be empty).
    fn synthesize(&mut self, text: &str) -> Result<Vec<i16>>;

    /// Return the audio for any text still buffered.
    fn flush(&mut self) -> Result<Vec<i16>>;
}

/// Factory for audio output devices.
pub trait AudioOutput: Send + Sync {
    /// Open a mono device at `sample_rate`. The device must honor
    /// `state`: while it is not [`PlayState::is_started`] nothing is
    /// rendered and writes are dropped.
    fn open(&self, sample_rate: u32, state: PlayState) -> Result<Box<dyn OutputDevice>>;
}

/// An open audio output. Dropping it releases the hardware.
///
/// Devices stay on the playback worker that opened them, so they need not
/// be `Send`.
pub trait OutputDevice {
    /// Begin rendering; moves the shared play state to started.
    fn start(&mut self) -> Result<()>;

    /// Queue samples for playback.
    fn write(&mut self, pcm: &[i16]) -> Result<()>;

    /// Block until queued audio has played or the device was stopped.
    fn drain(&mut self) -> Result<()>;

    /// Stop rendering and discard anything still queued.
    fn stop(&mut self) -> Result<()>;
}

/// Everything the coordinator needs to run, loaded up front.
pub struct InitializedEngines {
    pub wake_word: Box<dyn WakeWordDetector>,
    pub transcriber: Box<dyn Transcriber>,
    pub generator: Box<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub output: Arc<dyn AudioOutput>,
}
