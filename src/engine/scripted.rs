//! Deterministic engines and an in-memory output device.
//!
//! Used by the test suite and the `demo` command to drive the full
//! pipeline without models, network or sound hardware.

use super::{
    AudioOutput, GenerateParams, GeneratedText, Generator, InterruptFlag, OutputDevice,
    SynthesisStream, Synthesizer, TokenSink, TranscriptPartial, Transcriber, WakeWordDetector,
};
use crate::audio::PlayState;
use crate::dialog::{DialogHistory, Turn};
use crate::error::{AssistantError, Result, Stage};
use crate::pipeline::messages::EndpointReason;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Fires the wake word on chosen frames, counted from the first frame this
/// detector processed.
#[derive(Debug, Default)]
pub struct ScriptedWakeWord {
    hits: Vec<usize>,
    fail_at: Option<usize>,
    processed: usize,
}

impl ScriptedWakeWord {
    pub fn new(hits: impl IntoIterator<Item = usize>) -> Self {
        Self {
            hits: hits.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Fail when processing the given frame.
    #[must_use]
    pub fn failing_at(mut self, frame: usize) -> Self {
        self.fail_at = Some(frame);
        self
    }
}

impl WakeWordDetector for ScriptedWakeWord {
    fn process(&mut self, _frame: &[i16]) -> Result<Option<usize>> {
        let index = self.processed;
        self.processed += 1;
        if self.fail_at == Some(index) {
            return Err(AssistantError::engine(Stage::WakeWord, "scripted detector failure"));
        }
        Ok(self.hits.contains(&index).then_some(0))
    }
}

/// Replays a fixed list of transcription steps, one per frame.
#[derive(Debug, Default)]
pub struct ScriptedTranscriber {
    steps: VecDeque<std::result::Result<TranscriptPartial, String>>,
    flushes: VecDeque<String>,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next frame yields `text` without an endpoint.
    #[must_use]
    pub fn partial(mut self, text: &str) -> Self {
        self.steps.push_back(Ok(TranscriptPartial {
            text: text.to_owned(),
            is_endpoint: false,
        }));
        self
    }

    /// Next frame yields `text` and ends the utterance.
    #[must_use]
    pub fn endpoint(mut self, text: &str) -> Self {
        self.steps.push_back(Ok(TranscriptPartial {
            text: text.to_owned(),
            is_endpoint: true,
        }));
        self
    }

    /// Next `frames` frames recognize nothing.
    #[must_use]
    pub fn silence(mut self, frames: usize) -> Self {
        for _ in 0..frames {
            self.steps.push_back(Ok(TranscriptPartial::default()));
        }
        self
    }

    /// Next frame fails.
    #[must_use]
    pub fn failure(mut self, message: &str) -> Self {
        self.steps.push_back(Err(message.to_owned()));
        self
    }

    /// Queue the text returned by the next [`Transcriber::flush`].
    #[must_use]
    pub fn flush_with(mut self, text: &str) -> Self {
        self.flushes.push_back(text.to_owned());
        self
    }
}

impl Transcriber for ScriptedTranscriber {
    fn process(&mut self, _frame: &[i16]) -> Result<TranscriptPartial> {
        match self.steps.pop_front() {
            Some(Ok(partial)) => Ok(partial),
            Some(Err(message)) => Err(AssistantError::engine(Stage::Transcription, message)),
            None => Ok(TranscriptPartial::default()),
        }
    }

    fn flush(&mut self) -> Result<String> {
        Ok(self.flushes.pop_front().unwrap_or_default())
    }
}

/// Dialogs the scripted generator was prompted with, one per run.
pub type PromptLog = Arc<Mutex<Vec<Vec<Turn>>>>;

/// Streams a fixed list of fragments.
pub struct ScriptedGenerator {
    fragments: Vec<String>,
    endpoint: EndpointReason,
    hold_after: Option<usize>,
    hold_timeout: Duration,
    fragment_delay: Duration,
    fail_after: Option<(usize, String)>,
    interrupt: InterruptFlag,
    prompts: PromptLog,
}

impl ScriptedGenerator {
    pub fn new<S: Into<String>>(fragments: impl IntoIterator<Item = S>) -> Self {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            endpoint: EndpointReason::NaturalStop,
            hold_after: None,
            hold_timeout: Duration::from_secs(5),
            fragment_delay: Duration::ZERO,
            fail_after: None,
            interrupt: InterruptFlag::new(),
            prompts: PromptLog::default(),
        }
    }

    /// Reason reported when every fragment was sent.
    #[must_use]
    pub fn ending_with(mut self, endpoint: EndpointReason) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// After `sent` fragments, block until interrupted (or `timeout`).
    #[must_use]
    pub fn hold_after(mut self, sent: usize, timeout: Duration) -> Self {
        self.hold_after = Some(sent);
        self.hold_timeout = timeout;
        self
    }

    /// Sleep before every fragment.
    #[must_use]
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Fail once `sent` fragments were streamed.
    #[must_use]
    pub fn failing_after(mut self, sent: usize, message: &str) -> Self {
        self.fail_after = Some((sent, message.to_owned()));
        self
    }

    /// Shared log of every dialog this generator was prompted with.
    pub fn prompt_log(&self) -> PromptLog {
        Arc::clone(&self.prompts)
    }

    fn hold(&self) {
        let deadline = Instant::now() + self.hold_timeout;
        while !self.interrupt.is_raised() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn interrupted(text: String) -> Result<GeneratedText> {
        Ok(GeneratedText {
            text,
            endpoint: EndpointReason::Interrupted,
        })
    }
}

impl Generator for ScriptedGenerator {
    fn generate(
        &mut self,
        dialog: &DialogHistory,
        _params: &GenerateParams,
        tokens: &TokenSink,
    ) -> Result<GeneratedText> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dialog.turns().to_vec());

        let mut text = String::new();
        for (sent, fragment) in self.fragments.iter().enumerate() {
            if self.hold_after == Some(sent) {
                self.hold();
            }
            if let Some((_, message)) = self.fail_after.as_ref().filter(|(n, _)| *n == sent) {
                return Err(AssistantError::engine(Stage::Generation, message.clone()));
            }
            if self.interrupt.is_raised() {
                return Self::interrupted(text);
            }
            if !self.fragment_delay.is_zero() {
                std::thread::sleep(self.fragment_delay);
            }
            text.push_str(fragment);
            if tokens.send(fragment.clone()).is_err() {
                return Self::interrupted(text);
            }
        }

        let sent = self.fragments.len();
        if self.hold_after == Some(sent) {
            self.hold();
        }
        if let Some((_, message)) = self.fail_after.as_ref().filter(|(n, _)| *n == sent) {
            return Err(AssistantError::engine(Stage::Generation, message.clone()));
        }
        if self.interrupt.is_raised() {
            return Self::interrupted(text);
        }
        Ok(GeneratedText {
            text,
            endpoint: self.endpoint,
        })
    }

    fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }
}

#[derive(Debug, Default)]
struct SynthLog {
    fragments: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Renders `samples_per_char` samples per input character.
///
/// Every non-empty chunk is filled with its 1-based position in the
/// stream, so chunk order survives into the played samples.
#[derive(Clone)]
pub struct ScriptedSynthesizer {
    sample_rate: u32,
    samples_per_char: usize,
    flush_samples: usize,
    fail_on: Option<String>,
    delay: Duration,
    log: Arc<SynthLog>,
}

impl ScriptedSynthesizer {
    pub fn new(sample_rate: u32, samples_per_char: usize) -> Self {
        Self {
            sample_rate,
            samples_per_char,
            flush_samples: 0,
            fail_on: None,
            delay: Duration::ZERO,
            log: Arc::default(),
        }
    }

    /// Samples returned by every flush.
    #[must_use]
    pub fn with_flush_samples(mut self, samples: usize) -> Self {
        self.flush_samples = samples;
        self
    }

    /// Fail when asked to synthesize a fragment containing `needle`.
    #[must_use]
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_owned());
        self
    }

    /// Sleep inside every `synthesize` call, like a remote voice.
    #[must_use]
    pub fn with_synthesis_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every fragment passed to `synthesize`, across all streams.
    pub fn fragments(&self) -> Vec<String> {
        self.log
            .fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn streams_opened(&self) -> usize {
        self.log.opened.load(Ordering::Acquire)
    }

    pub fn streams_closed(&self) -> usize {
        self.log.closed.load(Ordering::Acquire)
    }
}

impl Synthesizer for ScriptedSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open_stream(&self) -> Result<Box<dyn SynthesisStream>> {
        self.log.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ScriptedStream {
            synth: self.clone(),
            chunks: 0,
        }))
    }
}

struct ScriptedStream {
    synth: ScriptedSynthesizer,
    chunks: i16,
}

impl ScriptedStream {
    fn chunk(&mut self, len: usize) -> Vec<i16> {
        if len == 0 {
            return Vec::new();
        }
        self.chunks = self.chunks.saturating_add(1);
        vec![self.chunks; len]
    }
}

impl SynthesisStream for ScriptedStream {
    fn synthesize(&mut self, text: &str) -> Result<Vec<i16>> {
        self.synth
            .log
            .fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_owned());
        if !self.synth.delay.is_zero() {
            std::thread::sleep(self.synth.delay);
        }
        if self
            .synth
            .fail_on
            .as_deref()
            .is_some_and(|needle| text.contains(needle))
        {
            return Err(AssistantError::engine(
                Stage::Synthesis,
                format!("scripted synthesis failure on {text:?}"),
            ));
        }
        Ok(self.chunk(text.chars().count() * self.synth.samples_per_char))
    }

    fn flush(&mut self) -> Result<Vec<i16>> {
        Ok(self.chunk(self.synth.flush_samples))
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.synth.log.closed.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct OutputLog {
    writes: Mutex<Vec<Vec<i16>>>,
    dropped_writes: AtomicUsize,
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Output backend that records what would have been played.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    log: Arc<OutputLog>,
    write_delay: Duration,
    fail_writes: bool,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every accepted write, like a device with a full buffer.
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Every write fails with a device error.
    #[must_use]
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Chunks accepted while the device was started, in order.
    pub fn writes(&self) -> Vec<Vec<i16>> {
        self.log
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All accepted samples, concatenated.
    pub fn samples(&self) -> Vec<i16> {
        self.writes().concat()
    }

    /// Writes refused because the device was not started.
    pub fn dropped_writes(&self) -> usize {
        self.log.dropped_writes.load(Ordering::Acquire)
    }

    pub fn devices_opened(&self) -> usize {
        self.log.opened.load(Ordering::Acquire)
    }

    pub fn devices_released(&self) -> usize {
        self.log.released.load(Ordering::Acquire)
    }
}

impl AudioOutput for MemoryOutput {
    fn open(&self, _sample_rate: u32, state: PlayState) -> Result<Box<dyn OutputDevice>> {
        self.log.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryDevice {
            output: self.clone(),
            state,
        }))
    }
}

struct MemoryDevice {
    output: MemoryOutput,
    state: PlayState,
}

impl OutputDevice for MemoryDevice {
    fn start(&mut self) -> Result<()> {
        self.state.start();
        Ok(())
    }

    fn write(&mut self, pcm: &[i16]) -> Result<()> {
        if self.output.fail_writes {
            return Err(AssistantError::Device("scripted write failure".into()));
        }
        if !self.state.is_started() {
            self.output.log.dropped_writes.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        self.output
            .log
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pcm.to_vec());
        if !self.output.write_delay.is_zero() {
            std::thread::sleep(self.output.write_delay);
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.stop();
        Ok(())
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.output.log.released.fetch_add(1, Ordering::AcqRel);
    }
}
