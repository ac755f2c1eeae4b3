//! Barge-in handling.
//!
//! [`InterruptController::interrupt`] is called from the real-time frame
//! thread. It only flips flags and never waits on a lock: the stages
//! notice on their own schedule (the generator at its next fragment,
//! playback at its next write or audio callback).

use crate::audio::PlayState;
use crate::engine::InterruptFlag;
use crate::pipeline::handoff::ActiveFlag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, TryLockError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Signals shared between one pipeline run and the controller.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub id: u64,
    pub cancel: CancellationToken,
    pub play_state: PlayState,
    /// Set while the generation stage is still producing tokens.
    pub generating: ActiveFlag,
    /// The generator's own stop signal.
    pub stop_generation: InterruptFlag,
}

impl RunHandle {
    /// Cancel the run, cut generation short while it is still producing,
    /// and stop playback (or keep it from ever starting).
    pub fn signal(&self) {
        self.cancel.cancel();
        if self.generating.is_active() {
            self.stop_generation.raise();
        }
        if self.play_state.stop() {
            debug!("playback stopped for run {}", self.id);
        } else {
            self.play_state.halt();
        }
    }
}

/// Cancels the active pipeline run.
///
/// The frame thread never waits on the slot lock: an interrupt that finds
/// it held raises `pending`, and whoever holds the lock signals on release.
#[derive(Debug, Default)]
pub struct InterruptController {
    active: Mutex<Option<RunHandle>>,
    registered: AtomicBool,
    pending: AtomicBool,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `run` the target of future interrupts.
    pub fn register(&self, run: RunHandle) {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            *active = Some(run);
            self.registered.store(true, Ordering::Release);
        }
        self.deliver();
    }

    /// Forget `run_id` if it is still the registered run.
    pub fn unregister(&self, run_id: u64) {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().is_some_and(|run| run.id == run_id) {
                *active = None;
                self.registered.store(false, Ordering::Release);
            }
        }
        self.deliver();
    }

    /// Stop generation and playback of the registered run, if any.
    ///
    /// Idempotent and non-blocking. Returns `true` if a run was signalled
    /// or, when the slot was busy, if one was registered.
    pub fn interrupt(&self) -> bool {
        self.pending.store(true, Ordering::SeqCst);
        match self.deliver() {
            Some(signalled) => signalled,
            None => {
                debug!("interrupt deferred to the slot holder");
                self.registered.load(Ordering::Acquire)
            }
        }
    }

    /// Signal the registered run for a pending interrupt. Returns `None`
    /// if another thread holds the slot; it delivers after releasing it.
    fn deliver(&self) -> Option<bool> {
        let mut signalled = false;
        while self.pending.load(Ordering::SeqCst) {
            let active = match self.active.try_lock() {
                Ok(active) => active,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return None,
            };
            if !self.pending.swap(false, Ordering::SeqCst) {
                break;
            }
            match active.as_ref() {
                Some(run) => {
                    debug!("interrupting run {}", run.id);
                    run.signal();
                    signalled = true;
                }
                None => debug!("interrupt with no active run"),
            }
        }
        Some(signalled)
    }
}
