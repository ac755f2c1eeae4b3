//! Synthesis stage: token chunks in, PCM chunks out.

use crate::engine::Synthesizer;
use crate::error::Result;
use crate::pipeline::handoff::{Consumer, Producer};
use crate::pipeline::messages::{PcmChunk, TokenChunk};
use crate::profiling::{DelayProfiler, RtfProfiler};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Holds the first audio back until it is long enough to start playback
/// without an audible gap.
///
/// Once the floor is reached the held audio leaves as one chunk and later
/// chunks pass straight through.
#[derive(Debug)]
pub struct WarmupBuffer {
    floor: usize,
    pending: Vec<i16>,
    released: bool,
}

impl WarmupBuffer {
    pub fn new(floor_secs: f32, sample_rate: u32) -> Self {
        Self {
            floor: (floor_secs.max(0.0) * sample_rate as f32) as usize,
            pending: Vec::new(),
            released: false,
        }
    }

    /// Minimum samples before the first release.
    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Offer a chunk. Returns what should be queued for playback now.
    pub fn push(&mut self, chunk: PcmChunk) -> Option<PcmChunk> {
        if chunk.is_empty() {
            return None;
        }
        if self.released {
            return Some(chunk);
        }
        self.pending.extend(chunk);
        if self.pending.len() >= self.floor {
            self.released = true;
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }

    /// End of stream: deliver whatever is held together with `tail`, even
    /// when the floor was never reached.
    pub fn finish(&mut self, tail: PcmChunk) -> Option<PcmChunk> {
        if self.released {
            return (!tail.is_empty()).then_some(tail);
        }
        self.released = true;
        self.pending.extend(tail);
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }

    /// Drop held audio. Returns the number of samples discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

/// Stage tunables.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisSettings {
    pub warmup_secs: f32,
    pub poll_interval: Duration,
    /// When the utterance ended; first-audio latency is measured from here.
    pub started_at: Instant,
}

/// Numbers the stage reports on success.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthesisOutcome {
    pub chunks_pushed: usize,
    pub real_time_factor: f64,
    pub first_audio_delay_secs: f64,
}

/// Run the synthesis stage to completion on the calling (blocking) thread.
///
/// The stream is opened before waiting on the token gate. A cancelled run
/// keeps draining tokens without synthesizing them and skips the flush.
///
/// # Errors
///
/// Returns the synthesizer's error. Held warmup audio is discarded, the
/// PCM handoff is finished and the stream is closed on every path.
pub fn run_synthesis_stage(
    synthesizer: Arc<dyn Synthesizer>,
    tokens: Consumer<TokenChunk>,
    mut pcm: Producer<PcmChunk>,
    cancel: CancellationToken,
    settings: SynthesisSettings,
) -> Result<SynthesisOutcome> {
    let sample_rate = synthesizer.sample_rate();
    let mut stream = synthesizer.open_stream()?;
    let mut warmup = WarmupBuffer::new(settings.warmup_secs, sample_rate);
    let mut rtf = RtfProfiler::new(sample_rate);
    let mut delay = DelayProfiler::start_at(settings.started_at);

    tokens.wait_ready();
    while !tokens.is_drained() {
        let Some(token) = tokens.try_pop() else {
            std::thread::sleep(settings.poll_interval);
            continue;
        };
        if cancel.is_cancelled() {
            continue;
        }

        rtf.tick();
        let audio = match stream.synthesize(&token) {
            Ok(audio) => audio,
            Err(e) => {
                discard_warmup(&mut warmup);
                return Err(e);
            }
        };
        rtf.tock(&audio);

        if let Some(chunk) = warmup.push(audio) {
            delay.mark();
            pcm.push(chunk);
        }
    }

    if cancel.is_cancelled() {
        discard_warmup(&mut warmup);
    } else {
        let tail = match stream.flush() {
            Ok(tail) => tail,
            Err(e) => {
                discard_warmup(&mut warmup);
                return Err(e);
            }
        };
        if let Some(chunk) = warmup.finish(tail) {
            delay.mark();
            pcm.push(chunk);
        }
    }

    let outcome = SynthesisOutcome {
        chunks_pushed: pcm.pushed(),
        real_time_factor: rtf.rtf(),
        first_audio_delay_secs: delay.delay(),
    };
    debug!(
        "synthesis pushed {} chunks (rtf {:.2})",
        outcome.chunks_pushed, outcome.real_time_factor
    );
    pcm.finish();
    drop(stream);
    Ok(outcome)
}

fn discard_warmup(warmup: &mut WarmupBuffer) {
    let dropped = warmup.discard();
    if dropped > 0 {
        warn!("discarded {dropped} samples of unplayed warmup audio");
    }
}
