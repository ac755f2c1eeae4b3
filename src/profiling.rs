//! Throughput and latency bookkeeping for a pipeline run.
//!
//! All profilers are plain counters: they never block and reset after
//! every read so one instance can be reused across runs.

use std::time::{Duration, Instant};

/// Tokens-per-second meter for the generation stage.
///
/// The first [`tock`](Self::tock) only starts the clock; every later one
/// counts a token and moves the end timestamp forward.
#[derive(Debug, Default)]
pub struct TpsProfiler {
    start: Option<Instant>,
    end: Option<Instant>,
    count: u32,
}

impl TpsProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one streamed fragment.
    pub fn tock(&mut self) {
        self.tock_at(Instant::now());
    }

    fn tock_at(&mut self, now: Instant) {
        if self.start.is_none() {
            self.start = Some(now);
            return;
        }
        self.count += 1;
        self.end = Some(now);
    }

    /// Tokens per second since the first tock, then reset.
    pub fn tps(&mut self) -> f64 {
        let elapsed = match (self.start, self.end) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            _ => 0.0,
        };
        let tps = if elapsed > 0.0 {
            f64::from(self.count) / elapsed
        } else {
            0.0
        };
        *self = Self::default();
        tps
    }
}

/// Real-time factor meter for the synthesis stage: compute time divided
/// by the duration of the audio that compute produced.
#[derive(Debug)]
pub struct RtfProfiler {
    sample_rate: u32,
    tick: Option<Instant>,
    compute: Duration,
    audio_secs: f64,
}

impl RtfProfiler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            tick: None,
            compute: Duration::ZERO,
            audio_secs: 0.0,
        }
    }

    /// Start timing one synthesis call.
    pub fn tick(&mut self) {
        self.tick = Some(Instant::now());
    }

    /// Finish timing the call that produced `pcm`.
    pub fn tock(&mut self, pcm: &[i16]) {
        if let Some(tick) = self.tick.take() {
            self.record(tick.elapsed(), pcm.len());
        }
    }

    fn record(&mut self, compute: Duration, samples: usize) {
        self.compute += compute;
        if self.sample_rate > 0 {
            self.audio_secs += samples as f64 / f64::from(self.sample_rate);
        }
    }

    /// Real-time factor accumulated so far, then reset.
    pub fn rtf(&mut self) -> f64 {
        let rtf = if self.audio_secs > 0.0 {
            self.compute.as_secs_f64() / self.audio_secs
        } else {
            0.0
        };
        self.tick = None;
        self.compute = Duration::ZERO;
        self.audio_secs = 0.0;
        rtf
    }
}

/// Latency from the end of the user's utterance to the first audio handed
/// to playback.
#[derive(Debug, Default)]
pub struct DelayProfiler {
    start: Option<Instant>,
    end: Option<Instant>,
}

impl DelayProfiler {
    /// Start measuring from `at`.
    pub fn start_at(at: Instant) -> Self {
        Self {
            start: Some(at),
            end: None,
        }
    }

    /// Mark the first audio. Later calls are ignored.
    pub fn mark(&mut self) {
        if self.start.is_some() && self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    /// Measured delay in seconds (0 if never marked), then reset.
    pub fn delay(&mut self) -> f64 {
        let delay = match (self.start, self.end) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            _ => 0.0,
        };
        *self = Self::default();
        delay
    }
}

/// Numbers collected for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileReport {
    /// Generation throughput.
    pub tokens_per_sec: f64,
    /// Synthesis real-time factor (<1 is faster than playback).
    pub real_time_factor: f64,
    /// Utterance end to first audio, in seconds.
    pub first_audio_delay_secs: f64,
}
