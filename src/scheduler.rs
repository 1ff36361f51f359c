//! Deferred Capture Scheduler
//!
//! Turns a server-issued absolute capture time into a one-shot timer on the
//! local monotonic clock. There is exactly one timer slot: arming a new
//! capture cancels whatever was pending (last writer wins, no queue).

use anyhow::Result;
use log::{debug, info};
use std::time::Duration;

use crate::clock_sync::ClockSynchronizer;
use crate::timer::FireSignal;
use crate::traits::OneShotTimer;

/// What the scheduler decided for one capture command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureDecision {
    /// Target already reached (or just missed). Capture now, no timer.
    Immediate,
    /// Timer armed for this long.
    Deferred { delay: Duration },
}

pub struct CaptureScheduler<T: OneShotTimer> {
    timer: T,
    signal: FireSignal,
    late_tolerance_secs: f64,
    // Local monotonic time the pending capture should fire at.
    pending_fire_at: Option<f64>,
}

impl<T: OneShotTimer> CaptureScheduler<T> {
    pub fn new(timer: T, signal: FireSignal, late_tolerance_secs: f64) -> Self {
        CaptureScheduler {
            timer,
            signal,
            late_tolerance_secs,
            pending_fire_at: None,
        }
    }

    pub fn on_capture_command(
        &mut self,
        target_time: f64,
        clock: &ClockSynchronizer,
        local_now: f64,
    ) -> Result<CaptureDecision> {
        let mut delay = target_time - clock.now(local_now);

        // Absorb sync/command jitter around the deadline.
        if delay < 0.0 && delay >= -self.late_tolerance_secs {
            delay = 0.0;
        }

        if delay <= 0.0 {
            info!("[CAPTURE] Target time reached ({:+.3}s), capturing immediately", delay);
            return Ok(CaptureDecision::Immediate);
        }

        let delay = timer_delay(delay);

        self.timer.stop();
        if let Some(prev) = self.pending_fire_at.take() {
            debug!("[CAPTURE] Replacing pending capture due at {:.3}s", prev);
        }

        // Fresh generation: expiries of the replaced capture are void from here on
        self.signal.arm();
        if let Err(e) = self.timer.start_once(delay) {
            self.signal.disarm();
            return Err(e);
        }
        self.pending_fire_at = Some(local_now + delay.as_secs_f64());
        info!("[CAPTURE] Scheduled in {} ms", delay.as_millis());

        Ok(CaptureDecision::Deferred { delay })
    }

    /// Consume the fire signal. True when the pending capture is due now.
    pub fn take_fired(&mut self) -> bool {
        if self.signal.take() {
            self.pending_fire_at = None;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> Option<f64> {
        self.pending_fire_at
    }
}

/// Seconds to timer resolution (microseconds), rounded up so the timer never
/// fires before the target.
fn timer_delay(delay_secs: f64) -> Duration {
    Duration::from_micros((delay_secs * 1_000_000.0).ceil() as u64)
}
