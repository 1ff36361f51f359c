use std::time::Instant;

use crate::traits::MonotonicClock;

/// Process-local monotonic clock. Origin is construction time, like a
/// microcontroller's uptime counter.
pub struct InstantClock {
    origin: Instant,
}

impl InstantClock {
    pub fn new() -> Self {
        InstantClock { origin: Instant::now() }
    }
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for InstantClock {
    fn monotonic_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}
