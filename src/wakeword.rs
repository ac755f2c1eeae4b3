//! MFCC + DTW keyword spotter.
//!
//! Live audio is compared against reference recordings of the wake word.
//! Each reference is reduced to a sequence of MFCC vectors; a sliding one
//! second window of live audio is reduced the same way and aligned against
//! every reference with dynamic time warping.

use crate::audio::i16_to_f32;
use crate::config::WakewordConfig;
use crate::engine::WakeWordDetector;
use crate::error::{AssistantError, Result, Stage};
use crate::vad::rms_energy;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// FFT window in samples (25ms at 16kHz).
const FRAME_SIZE: usize = 400;
/// Hop between analysis frames (10ms at 16kHz).
const HOP_SIZE: usize = 160;
const NUM_MEL_FILTERS: usize = 26;
/// Audio is never resampled here.
const REQUIRED_SAMPLE_RATE: u32 = 16_000;

/// Turns PCM into MFCC sequences.
struct MfccExtractor {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
    num_mfcc: usize,
}

impl MfccExtractor {
    fn new(num_mfcc: usize) -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FRAME_SIZE);
        let window = (0..FRAME_SIZE)
            .map(|n| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (FRAME_SIZE - 1) as f32).cos())
            })
            .collect();
        Self {
            fft,
            window,
            filterbank: mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, REQUIRED_SAMPLE_RATE),
            num_mfcc,
        }
    }

    /// One MFCC vector per 10ms hop.
    fn extract(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        if samples.len() < FRAME_SIZE {
            return Vec::new();
        }
        let power_len = FRAME_SIZE / 2 + 1;
        let mut buf = vec![Complex::new(0.0f32, 0.0); FRAME_SIZE];

        samples
            .windows(FRAME_SIZE)
            .step_by(HOP_SIZE)
            .map(|frame| {
                for ((slot, &s), &w) in buf.iter_mut().zip(frame).zip(&self.window) {
                    *slot = Complex::new(s * w, 0.0);
                }
                self.fft.process(&mut buf);

                let power: Vec<f32> = buf[..power_len]
                    .iter()
                    .map(|c| c.norm_sqr() / FRAME_SIZE as f32)
                    .collect();
                let log_mel: Vec<f32> = self
                    .filterbank
                    .iter()
                    .map(|filter| {
                        let energy: f32 = filter.iter().zip(&power).map(|(f, p)| f * p).sum();
                        energy.max(1e-10).ln()
                    })
                    .collect();
                dct_ii(&log_mel, self.num_mfcc)
            })
            .collect()
    }
}

/// Wake word spotter over 16kHz frames.
pub struct WakewordSpotter {
    extractor: MfccExtractor,
    references: Vec<Vec<Vec<f32>>>,
    threshold: f32,
    window_samples: usize,
    buffer: Vec<f32>,
    cooldown_samples: usize,
    cooldown_left: usize,
}

impl WakewordSpotter {
    /// Load every `*.wav` reference from the configured directory.
    ///
    /// # Errors
    ///
    /// Returns an init error if the sample rate is not 16kHz or no usable
    /// reference is found.
    pub fn new(config: &WakewordConfig, sample_rate: u32) -> Result<Self> {
        if sample_rate != REQUIRED_SAMPLE_RATE {
            return Err(AssistantError::init(
                Stage::WakeWord,
                format!("spotter requires {REQUIRED_SAMPLE_RATE}Hz audio, got {sample_rate}Hz"),
            ));
        }
        let extractor = MfccExtractor::new(config.num_mfcc.max(1));
        let references = load_references(&config.references_dir, &extractor)?;
        if references.is_empty() {
            return Err(AssistantError::init(
                Stage::WakeWord,
                format!(
                    "no wake word recordings found in {}",
                    config.references_dir.display()
                ),
            ));
        }
        info!(
            "wake word spotter loaded {} references, threshold={}",
            references.len(),
            config.threshold
        );
        Ok(Self::from_references(
            extractor,
            references,
            config.threshold,
            config.cooldown_ms,
        ))
    }

    fn from_references(
        extractor: MfccExtractor,
        references: Vec<Vec<Vec<f32>>>,
        threshold: f32,
        cooldown_ms: u64,
    ) -> Self {
        let window_samples = REQUIRED_SAMPLE_RATE as usize;
        Self {
            extractor,
            references,
            threshold,
            window_samples,
            buffer: Vec::with_capacity(window_samples * 2),
            cooldown_samples: (cooldown_ms as usize * REQUIRED_SAMPLE_RATE as usize) / 1000,
            cooldown_left: 0,
        }
    }

    /// Best similarity (0..1) of `window` against any reference.
    fn score(&self, window: &[f32]) -> f32 {
        let mfccs = self.extractor.extract(window);
        self.references
            .iter()
            .map(|reference| 1.0 / (1.0 + dtw_distance(&mfccs, reference)))
            .fold(0.0, f32::max)
    }
}

impl WakeWordDetector for WakewordSpotter {
    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>> {
        if self.cooldown_left > 0 {
            self.cooldown_left = self.cooldown_left.saturating_sub(frame.len());
            return Ok(None);
        }

        self.buffer.extend(i16_to_f32(frame));
        if self.buffer.len() < self.window_samples {
            return Ok(None);
        }

        let start = self.buffer.len() - self.window_samples;
        let score = self.score(&self.buffer[start..]);
        debug!("wake word score {score:.3}");

        if score >= self.threshold {
            info!("wake word detected (score {score:.3})");
            self.buffer.clear();
            self.cooldown_left = self.cooldown_samples;
            return Ok(Some(0));
        }

        // Overlap consecutive windows by half.
        let keep = self.window_samples / 2;
        let drop = self.buffer.len().saturating_sub(keep);
        self.buffer.drain(..drop);
        Ok(None)
    }
}

/// Cut leading and trailing silence from a reference recording, keeping
/// one 10ms window of padding on each side. Silent input is returned whole.
pub fn trim_silence(samples: &[i16], threshold: f32) -> &[i16] {
    const WINDOW: usize = 160;
    let loud = |start: usize| {
        let end = (start + WINDOW).min(samples.len());
        rms_energy(&samples[start..end]) > threshold
    };
    let windows: Vec<usize> = (0..samples.len()).step_by(WINDOW).collect();
    let (Some(&first), Some(&last)) = (
        windows.iter().find(|&&w| loud(w)),
        windows.iter().rev().find(|&&w| loud(w)),
    ) else {
        return samples;
    };
    let start = first.saturating_sub(WINDOW);
    let end = (last + 2 * WINDOW).min(samples.len());
    &samples[start..end]
}

/// Write a 16kHz mono reference recording, creating its directory.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn save_reference(path: &Path, samples: &[i16]) -> Result<()> {
    let io_err = |e: hound::Error| AssistantError::Io(std::io::Error::other(e.to_string()));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: REQUIRED_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(io_err)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(io_err)?;
    }
    writer.finalize().map_err(io_err)
}

fn load_references(dir: &Path, extractor: &MfccExtractor) -> Result<Vec<Vec<Vec<f32>>>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| {
        AssistantError::init(Stage::WakeWord, format!("cannot read {}: {e}", dir.display()))
    })?;

    let mut refs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        match read_wav_mono(&path) {
            Ok(samples) => {
                let mfccs = extractor.extract(&samples);
                if !mfccs.is_empty() {
                    refs.push(mfccs);
                }
            }
            Err(e) => warn!("skipping wake word reference {}: {e}", path.display()),
        }
    }
    Ok(refs)
}

/// Read a 16kHz WAV file as mono f32 samples.
fn read_wav_mono(path: &Path) -> Result<Vec<f32>> {
    let wav_err = |e: hound::Error| AssistantError::init(Stage::WakeWord, format!("WAV error: {e}"));
    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    if spec.sample_rate != REQUIRED_SAMPLE_RATE {
        return Err(AssistantError::init(
            Stage::WakeWord,
            format!("reference must be {REQUIRED_SAMPLE_RATE}Hz, got {}Hz", spec.sample_rate),
        ));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale).map_err(wav_err))
                .collect::<Result<_>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(wav_err))
            .collect::<Result<_>>()?,
    };

    let channels = usize::from(spec.channels.max(1));
    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect())
}

fn mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let top = hz_to_mel(sample_rate as f32 / 2.0);
    let bins: Vec<usize> = (0..num_filters + 2)
        .map(|i| {
            let hz = mel_to_hz(top * i as f32 / (num_filters + 1) as f32);
            (((fft_size + 1) as f32 * hz / sample_rate as f32).floor() as usize).min(power_len - 1)
        })
        .collect();

    bins.windows(3)
        .map(|w| {
            let (left, center, right) = (w[0], w[1], w[2]);
            let mut filter = vec![0.0f32; power_len];
            for (i, v) in filter.iter_mut().enumerate() {
                *v = if (left..center).contains(&i) {
                    (i - left) as f32 / (center - left) as f32
                } else if (center..=right).contains(&i) && right > center {
                    (right - i) as f32 / (right - center) as f32
                } else {
                    0.0
                };
            }
            filter
        })
        .collect()
}

fn dct_ii(input: &[f32], num_coeffs: usize) -> Vec<f32> {
    let n = input.len() as f32;
    (0..num_coeffs)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    v * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2.0 * n)).cos()
                })
                .sum()
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Path-length normalized DTW distance between two MFCC sequences.
fn dtw_distance(input: &[Vec<f32>], reference: &[Vec<f32>]) -> f32 {
    let (n, m) = (input.len(), reference.len());
    if n == 0 || m == 0 {
        return f32::MAX;
    }

    // Two rolling rows of the cost matrix.
    let mut prev = vec![f32::MAX; m + 1];
    let mut curr = vec![f32::MAX; m + 1];
    prev[0] = 0.0;

    for a in input {
        curr[0] = f32::MAX;
        for (j, b) in reference.iter().enumerate() {
            let best = prev[j + 1].min(curr[j]).min(prev[j]);
            curr[j + 1] = euclidean(a, b) + best;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[m] / (n + m) as f32
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
