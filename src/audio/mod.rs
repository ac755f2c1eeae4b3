//! Audio capture and playback via cpal.

pub mod capture;
pub mod playback;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Play state of one output device, shared between the playback worker
/// (which starts it) and the interrupt controller (which may stop it from
/// any thread).
#[derive(Debug, Clone, Default)]
pub struct PlayState(Arc<AtomicU8>);

impl PlayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the device as rendering. A device that was already stopped
    /// stays stopped.
    pub fn start(&self) -> bool {
        self.0
            .compare_exchange(IDLE, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop the device if it is started. Returns `true` for the call that
    /// performed the transition.
    pub fn stop(&self) -> bool {
        self.0
            .compare_exchange(STARTED, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop the device whatever its current state; later starts are refused.
    pub fn halt(&self) {
        self.0.store(STOPPED, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.0.load(Ordering::Acquire) == STARTED
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) == STOPPED
    }
}

/// Convert float samples in `[-1, 1]` to 16-bit PCM.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
        .collect()
}

/// Convert 16-bit PCM to float samples in `[-1, 1]`.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| f32::from(s) / f32::from(i16::MAX))
        .collect()
}
