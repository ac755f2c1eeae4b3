//! Playback stage: PCM chunks in, sound out.

use crate::audio::PlayState;
use crate::engine::AudioOutput;
use crate::error::Result;
use crate::pipeline::handoff::Consumer;
use crate::pipeline::messages::PcmChunk;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the device actually received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackOutcome {
    pub chunks_written: usize,
    pub samples_written: usize,
    /// Chunks popped after the device stopped.
    pub chunks_skipped: usize,
}

/// Run the playback stage to completion on the calling (blocking) thread.
///
/// The device is opened and started before the PCM gate is awaited.
/// Chunks are written only while `play_state` is started; once an
/// interrupt stops it the remaining chunks are popped and dropped.
///
/// # Errors
///
/// Returns the device error. The device is released on every path.
pub fn run_playback_stage(
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    pcm: Consumer<PcmChunk>,
    play_state: PlayState,
    poll_interval: Duration,
) -> Result<PlaybackOutcome> {
    let mut device = output.open(sample_rate, play_state.clone())?;
    device.start()?;

    let mut outcome = PlaybackOutcome::default();
    pcm.wait_ready();
    while !pcm.is_drained() {
        let Some(chunk) = pcm.try_pop() else {
            std::thread::sleep(poll_interval);
            continue;
        };
        if !play_state.is_started() {
            outcome.chunks_skipped += 1;
            continue;
        }
        device.write(&chunk)?;
        outcome.chunks_written += 1;
        outcome.samples_written += chunk.len();
    }

    if play_state.is_started() {
        device.drain()?;
        device.stop()?;
    }
    debug!(
        "playback wrote {} chunks, skipped {}",
        outcome.chunks_written, outcome.chunks_skipped
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::engine::scripted::MemoryOutput;
    use crate::pipeline::handoff::handoff;

    const POLL: Duration = Duration::from_millis(1);

    #[test]
    fn plays_every_chunk_then_stops_and_releases() {
        let output = MemoryOutput::new();
        let (mut tx, rx) = handoff();
        tx.push(vec![1, 1]);
        tx.push(vec![2]);
        tx.finish();
        let state = PlayState::new();

        let outcome =
            run_playback_stage(Arc::new(output.clone()), 16_000, rx, state.clone(), POLL).unwrap();

        assert_eq!(outcome.chunks_written, 2);
        assert_eq!(outcome.samples_written, 3);
        assert_eq!(output.writes(), [vec![1, 1], vec![2]]);
        assert!(state.is_stopped());
        assert_eq!(output.devices_released(), 1);
    }

    #[test]
    fn empty_run_writes_nothing() {
        let output = MemoryOutput::new();
        let (tx, rx) = handoff::<PcmChunk>();
        tx.finish();

        let outcome =
            run_playback_stage(Arc::new(output.clone()), 16_000, rx, PlayState::new(), POLL)
                .unwrap();
        assert_eq!(outcome, PlaybackOutcome::default());
        assert_eq!(output.devices_opened(), 1);
        assert_eq!(output.devices_released(), 1);
    }

    #[test]
    fn halted_device_skips_all_writes() {
        let output = MemoryOutput::new();
        let (mut tx, rx) = handoff();
        tx.push(vec![1]);
        tx.finish();
        let state = PlayState::new();
        state.halt();

        let outcome =
            run_playback_stage(Arc::new(output.clone()), 16_000, rx, state, POLL).unwrap();
        assert_eq!(outcome.chunks_skipped, 1);
        assert!(output.writes().is_empty());
    }

    #[test]
    fn device_error_releases_device() {
        let output = MemoryOutput::new().failing_writes();
        let (mut tx, rx) = handoff();
        tx.push(vec![1]);
        tx.finish();

        let result = run_playback_stage(Arc::new(output.clone()), 16_000, rx, PlayState::new(), POLL);
        assert!(matches!(result, Err(crate::error::AssistantError::Device(_))));
        assert_eq!(output.devices_released(), 1);
    }
}
