//! One-shot capture timer and the signal it raises.
//!
//! The expiry context never runs capture logic itself. It only raises a
//! `FireSignal`; the control loop consumes the signal on its next tick.
//!
//! Every arm of the slot gets a fresh generation. An expiry raises the
//! generation it was armed with, and the control loop only accepts the
//! generation that is armed right now, so an expiry racing a re-arm can
//! never fire the newer capture.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::traits::OneShotTimer;

const NONE: u64 = 0;

#[derive(Debug, Default)]
struct SlotState {
    next: AtomicU64,
    armed: AtomicU64,
    fired: AtomicU64,
}

/// Generation-tagged fire flag shared between a timer context and the control loop.
#[derive(Debug, Clone, Default)]
pub struct FireSignal(Arc<SlotState>);

impl FireSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation. Anything raised for an earlier one is void.
    /// Called from the control loop only.
    pub fn arm(&self) -> u64 {
        let generation = self.0.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.fired.store(NONE, Ordering::SeqCst);
        self.0.armed.store(generation, Ordering::SeqCst);
        generation
    }

    pub fn disarm(&self) {
        self.0.armed.store(NONE, Ordering::SeqCst);
    }

    pub fn armed_generation(&self) -> Option<u64> {
        match self.0.armed.load(Ordering::SeqCst) {
            NONE => None,
            generation => Some(generation),
        }
    }

    /// Expiry of `generation`. Safe from any thread; a stale generation can
    /// never overwrite a newer one.
    pub fn raise_for(&self, generation: u64) {
        self.0.fired.fetch_max(generation, Ordering::SeqCst);
    }

    /// Expiry of whatever is armed right now.
    pub fn raise(&self) {
        if let Some(generation) = self.armed_generation() {
            self.raise_for(generation);
        }
    }

    /// Consume the signal. True at most once per armed generation, and only
    /// when that generation is the one that fired.
    pub fn take(&self) -> bool {
        let fired = self.0.fired.swap(NONE, Ordering::SeqCst);
        if fired == NONE {
            return false;
        }
        self.0
            .armed
            .compare_exchange(fired, NONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_raised(&self) -> bool {
        let fired = self.0.fired.load(Ordering::SeqCst);
        fired != NONE && fired == self.0.armed.load(Ordering::SeqCst)
    }
}

/// Thread-backed stand-in for a hardware one-shot timer slot.
///
/// Expires the generation that was armed on the signal when `start_once` ran.
/// `stop` disarms the signal, which voids any expiry still sleeping.
pub struct ThreadTimer {
    signal: FireSignal,
}

impl ThreadTimer {
    pub fn new(signal: FireSignal) -> Self {
        ThreadTimer { signal }
    }
}

impl OneShotTimer for ThreadTimer {
    fn start_once(&mut self, delay: Duration) -> Result<()> {
        let generation = match self.signal.armed_generation() {
            Some(generation) => generation,
            None => self.signal.arm(),
        };
        let signal = self.signal.clone();

        thread::Builder::new()
            .name("capture-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                signal.raise_for(generation);
            })?;

        Ok(())
    }

    fn stop(&mut self) {
        self.signal.disarm();
    }
}
