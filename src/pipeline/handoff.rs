//! Single-producer/single-consumer handoff between two pipeline stages.
//!
//! A handoff is three independent pieces: a FIFO queue, a one-shot
//! [`ReadinessGate`] that fires on the first push, and an [`ActiveFlag`]
//! the producer clears when it is done. Consumers never block on the queue
//! itself; they wait on the gate once, then poll until the flag is clear
//! and the queue is empty.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// One-shot "first item is available" event. Fires once, never resets.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    fired: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the gate. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.wake_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Block until the gate fires.
    pub fn wait(&self) {
        self.wait_while(|| true);
    }

    /// Block until the gate fires or `keep_waiting` returns false.
    /// `keep_waiting` is re-evaluated after every [`wake_all`](Self::wake_all).
    fn wait_while(&self, keep_waiting: impl Fn() -> bool) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_fired() && keep_waiting() {
            guard = self
                .signal
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake every waiter so it re-checks its exit condition.
    fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.signal.notify_all();
    }
}

/// Single-writer, multi-reader "producer is still running" flag.
#[derive(Debug, Clone)]
pub struct ActiveFlag(Arc<AtomicBool>);

impl ActiveFlag {
    pub fn new(active: bool) -> Self {
        Self(Arc::new(AtomicBool::new(active)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Shared {
    gate: ReadinessGate,
    active: ActiveFlag,
}

/// Create a handoff whose producer starts out active.
pub fn handoff<T>() -> (Producer<T>, Consumer<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared {
        gate: ReadinessGate::new(),
        active: ActiveFlag::new(true),
    });
    (
        Producer {
            tx,
            shared: Arc::clone(&shared),
            pushed: 0,
        },
        Consumer { rx, shared },
    )
}

/// Producing end. Dropping it clears the active flag, so every exit path
/// of the producing stage, errors included, finishes the handoff.
pub struct Producer<T> {
    tx: Sender<T>,
    shared: Arc<Shared>,
    pushed: usize,
}

impl<T> Producer<T> {
    /// Enqueue an item and fire the gate if this is the first one.
    pub fn push(&mut self, item: T) {
        // The consumer holds the receiver for the whole run; a send can only
        // fail once it has gone away, at which point nobody wants the item.
        if self.tx.send(item).is_ok() {
            self.pushed += 1;
            self.shared.gate.fire();
        }
    }

    /// Number of items enqueued so far.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// The flag consumers and the interrupt controller observe.
    pub fn active_flag(&self) -> ActiveFlag {
        self.shared.active.clone()
    }

    /// Clear the active flag after the final push.
    pub fn finish(self) {
        drop(self);
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.active.clear();
        self.shared.gate.wake_all();
    }
}

/// Consuming end.
pub struct Consumer<T> {
    rx: Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> Consumer<T> {
    /// Block until the first item was pushed or the producer finished.
    ///
    /// A producer that ends without pushing anything releases the consumer,
    /// whose loop then exits at once because the handoff is drained.
    pub fn wait_ready(&self) {
        self.shared.gate.wait_while(|| self.shared.active.is_active());
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn is_producer_active(&self) -> bool {
        self.shared.active.is_active()
    }

    pub fn is_gate_fired(&self) -> bool {
        self.shared.gate.is_fired()
    }

    /// True once the producer finished and nothing is left to pop.
    ///
    /// The flag is read before the queue so an item pushed just before the
    /// flag cleared is always seen.
    pub fn is_drained(&self) -> bool {
        !self.shared.active.is_active() && self.rx.is_empty()
    }
}
