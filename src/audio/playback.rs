//! Streaming audio output to system speakers via cpal.

use crate::audio::{PlayState, i16_to_f32};
use crate::config::AudioConfig;
use crate::engine::{AudioOutput, OutputDevice};
use crate::error::{AssistantError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

const POLL: Duration = Duration::from_millis(5);

/// Opens cpal output streams on the configured device.
pub struct CpalOutput {
    device_name: Option<String>,
    max_buffered_secs: f32,
}

impl CpalOutput {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
            max_buffered_secs: config.max_buffered_secs,
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AssistantError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(ref name) = self.device_name {
            host.output_devices()
                .map_err(|e| AssistantError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| AssistantError::Device(format!("output device '{name}' not found")))
        } else {
            host.default_output_device()
                .ok_or_else(|| AssistantError::Device("no default output device".into()))
        }
    }
}

impl AudioOutput for CpalOutput {
    fn open(&self, sample_rate: u32, state: PlayState) -> Result<Box<dyn OutputDevice>> {
        let device = self.find_device()?;
        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let cb_queue = Arc::clone(&queue);
        let cb_state = state.clone();

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let Ok(mut queue) = cb_queue.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    if !cb_state.is_started() {
                        queue.clear();
                        data.fill(0.0);
                        return;
                    }
                    for sample in data.iter_mut() {
                        *sample = queue.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| AssistantError::Device(format!("failed to build output stream: {e}")))?;

        info!("opened output device {device_name} at {sample_rate}Hz");

        let max_buffered = (self.max_buffered_secs.max(0.1) * sample_rate as f32) as usize;
        Ok(Box::new(CpalOutputDevice {
            stream,
            queue,
            state,
            max_buffered,
        }))
    }
}

/// One open cpal output stream. Dropping it closes the stream.
struct CpalOutputDevice {
    stream: cpal::Stream,
    queue: Arc<Mutex<VecDeque<f32>>>,
    state: PlayState,
    max_buffered: usize,
}

impl CpalOutputDevice {
    fn queued(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl OutputDevice for CpalOutputDevice {
    fn start(&mut self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| AssistantError::Device(format!("failed to start output stream: {e}")))?;
        self.state.start();
        Ok(())
    }

    fn write(&mut self, pcm: &[i16]) -> Result<()> {
        // Back-pressure: the callback drains the queue in real time.
        while self.state.is_started() && self.queued() > self.max_buffered {
            std::thread::sleep(POLL);
        }
        if !self.state.is_started() {
            debug!("dropping {} samples written after stop", pcm.len());
            return Ok(());
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(i16_to_f32(pcm));
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        while self.state.is_started() && self.queued() > 0 {
            std::thread::sleep(POLL);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.stop();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.stream
            .pause()
            .map_err(|e| AssistantError::Device(format!("failed to stop output stream: {e}")))
    }
}
