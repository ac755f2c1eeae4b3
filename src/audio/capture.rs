//! Microphone capture using cpal.
//!
//! Captures at the device's native format, downmixes to mono, resamples to
//! the routing rate and slices the stream into fixed-length 16-bit frames.

use crate::audio::f32_to_i16;
use crate::config::AudioConfig;
use crate::error::{AssistantError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Audio capture from the system microphone.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    frame_length: usize,
}

impl CpalCapture {
    /// Resolve the configured input device.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| AssistantError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| AssistantError::Device(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| AssistantError::Device("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| AssistantError::Device(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.sample_rate,
            frame_length: config.frame_length,
        })
    }

    /// Stream fixed-length frames into `tx` until `cancel` fires.
    ///
    /// Frames are dropped rather than queued when the receiver lags, so
    /// the audio callback never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the input stream cannot be created.
    pub async fn run(&self, tx: mpsc::Sender<Vec<i16>>, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let mut framer = Framer::new(self.frame_length);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = resample(&mono, native_rate, target_rate);
                    for frame in framer.push(&samples) {
                        if tx.try_send(frame).is_err() {
                            debug!("frame channel full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AssistantError::Device(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AssistantError::Device(format!("failed to start input stream: {e}")))?;

        info!(
            "audio capture started: native {}Hz x{} -> {}Hz frames of {}",
            native_rate, native_channels, target_rate, self.frame_length
        );

        cancel.cancelled().await;

        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AssistantError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// Slices an arbitrary-length sample stream into frames of one size.
pub struct Framer {
    frame_length: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_length: usize) -> Self {
        Self {
            frame_length: frame_length.max(1),
            pending: Vec::with_capacity(frame_length * 2),
        }
    }

    /// Append samples and return every complete frame now available.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_length * self.frame_length;
        let frames = self.pending[..complete]
            .chunks_exact(self.frame_length)
            .map(f32_to_i16)
            .collect();
        self.pending.drain(..complete);
        frames
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler, adequate for speech band audio.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos as usize).min(last);
            let frac = pos - idx as f64;
            let next = samples[(idx + 1).min(last)];
            (f64::from(samples[idx]) * (1.0 - frac) + f64::from(next) * frac) as f32
        })
        .collect()
}
