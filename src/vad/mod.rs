//! Utterance endpointing using RMS energy.

use crate::config::SttConfig;
use tracing::debug;

/// What one frame did to the endpointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadEvent {
    /// No speech in progress.
    Silence,
    /// Speech is in progress (possibly inside a short pause).
    Speech,
    /// The utterance ended; carries its samples.
    Endpoint(Vec<i16>),
}

/// Energy-threshold voice activity detector with trailing-silence endpoints.
pub struct EnergyEndpointer {
    threshold: f32,
    silence_needed: usize,
    min_speech: usize,
    max_samples: usize,
    in_speech: bool,
    silence_run: usize,
    speech: Vec<i16>,
}

impl EnergyEndpointer {
    pub fn new(config: &SttConfig, sample_rate: u32) -> Self {
        let per_ms = sample_rate as usize / 1000;
        Self {
            threshold: config.energy_threshold,
            silence_needed: config.endpoint_silence_ms as usize * per_ms,
            min_speech: config.min_speech_ms as usize * per_ms,
            max_samples: (config.max_utterance_secs.max(0.0) * sample_rate as f32) as usize,
            in_speech: false,
            silence_run: 0,
            speech: Vec::new(),
        }
    }

    pub fn is_in_speech(&self) -> bool {
        self.in_speech
    }

    /// Feed one frame.
    pub fn process(&mut self, frame: &[i16]) -> VadEvent {
        let is_speech = rms_energy(frame) > self.threshold;

        if is_speech {
            if !self.in_speech {
                debug!("speech started");
                self.in_speech = true;
                self.speech.clear();
            }
            self.silence_run = 0;
            self.speech.extend_from_slice(frame);
        } else if self.in_speech {
            // Keep pauses inside the utterance.
            self.silence_run += frame.len();
            self.speech.extend_from_slice(frame);
            if self.silence_run >= self.silence_needed {
                return self.end_segment();
            }
        } else {
            return VadEvent::Silence;
        }

        if self.max_samples > 0 && self.speech.len() >= self.max_samples {
            debug!("utterance hit the length cap");
            return self.end_segment();
        }
        VadEvent::Speech
    }

    /// Take whatever speech is buffered, ending the segment early.
    pub fn take(&mut self) -> Option<Vec<i16>> {
        match self.end_segment() {
            VadEvent::Endpoint(samples) => Some(samples),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.silence_run = 0;
        self.speech.clear();
    }

    fn end_segment(&mut self) -> VadEvent {
        let was_speaking = self.in_speech;
        let voiced = self.speech.len().saturating_sub(self.silence_run);
        self.in_speech = false;
        self.silence_run = 0;
        let samples = std::mem::take(&mut self.speech);
        if !was_speaking || voiced < self.min_speech {
            debug!("discarding {} samples of short speech", samples.len());
            return VadEvent::Silence;
        }
        VadEvent::Endpoint(samples)
    }
}

/// RMS energy of 16-bit samples, normalized to `[0, 1]`.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / f64::from(i16::MAX);
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 160; // 10ms

    fn config() -> SttConfig {
        SttConfig {
            energy_threshold: 0.05,
            endpoint_silence_ms: 50,
            min_speech_ms: 20,
            max_utterance_secs: 1.0,
            ..SttConfig::default()
        }
    }

    fn loud() -> Vec<i16> {
        vec![8_000; FRAME]
    }

    fn quiet() -> Vec<i16> {
        vec![0; FRAME]
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert_eq!(rms_energy(&quiet()), 0.0);
        assert!(rms_energy(&loud()) > 0.2);
    }

    #[test]
    fn trailing_silence_ends_utterance() {
        let mut vad = EnergyEndpointer::new(&config(), RATE);
        assert_eq!(vad.process(&quiet()), VadEvent::Silence);
        for _ in 0..5 {
            assert_eq!(vad.process(&loud()), VadEvent::Speech);
        }
        for _ in 0..4 {
            assert_eq!(vad.process(&quiet()), VadEvent::Speech);
        }
        match vad.process(&quiet()) {
            VadEvent::Endpoint(samples) => assert_eq!(samples.len(), 10 * FRAME),
            other => panic!("expected endpoint, got {other:?}"),
        }
        assert!(!vad.is_in_speech());
    }

    #[test]
    fn short_blips_are_discarded() {
        let mut vad = EnergyEndpointer::new(&config(), RATE);
        assert_eq!(vad.process(&loud()[..100]), VadEvent::Speech);
        let events: Vec<VadEvent> = (0..5).map(|_| vad.process(&quiet())).collect();
        assert_eq!(events.last(), Some(&VadEvent::Silence));
        assert!(!vad.is_in_speech());
        assert!(vad.take().is_none());
    }

    #[test]
    fn length_cap_forces_endpoint() {
        let mut vad = EnergyEndpointer::new(&config(), RATE);
        let mut endpoints = 0;
        for _ in 0..100 {
            if matches!(vad.process(&loud()), VadEvent::Endpoint(_)) {
                endpoints += 1;
            }
        }
        assert_eq!(endpoints, 1);
    }

    #[test]
    fn take_returns_buffered_speech() {
        let mut vad = EnergyEndpointer::new(&config(), RATE);
        for _ in 0..3 {
            vad.process(&loud());
        }
        assert_eq!(vad.take().map(|s| s.len()), Some(3 * FRAME));
        assert!(vad.take().is_none());
    }
}
