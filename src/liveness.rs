//! Liveness Monitor
//!
//! Two independent detectors run on top of an Open session:
//! - **Heartbeat**: a transport probe every `hb_interval` while none is
//!   outstanding. A probe unanswered for `hb_timeout` counts as a miss;
//!   `hb_max_misses` misses kill the session.
//! - **Soft watchdog**: no inbound activity at all for `soft_wd_interval`
//!   kills the session regardless of heartbeat state. This catches probes
//!   that silently fail to leave the node.

use log::{debug, warn};

use crate::config::LivenessConfig;
use crate::error::Fault;

/// Per-session heartbeat bookkeeping. Created fresh on every Open.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatState {
    pub last_probe_at: f64,
    pub awaiting_reply: bool,
    pub missed_replies: u32,
    pub last_activity_at: f64,
}

impl HeartbeatState {
    pub fn new(now: f64) -> Self {
        HeartbeatState {
            last_probe_at: now,
            awaiting_reply: false,
            missed_replies: 0,
            last_activity_at: now,
        }
    }

    pub fn mark_probe_sent(&mut self, now: f64) {
        self.awaiting_reply = true;
        self.last_probe_at = now;
    }

    /// A reply always counts as activity. It only clears the miss counter
    /// while a heartbeat is still outstanding; once it has timed out, a
    /// late reply can't undo the miss.
    pub fn on_reply(&mut self, now: f64) {
        self.last_activity_at = now;
        if !self.awaiting_reply {
            debug!("[HB] Late or unsolicited reply, {} missed stays", self.missed_replies);
            return;
        }
        if self.missed_replies > 0 {
            debug!("[HB] Reply received, clearing {} missed", self.missed_replies);
        }
        self.awaiting_reply = false;
        self.missed_replies = 0;
    }

    pub fn on_activity(&mut self, now: f64) {
        self.last_activity_at = now;
    }
}

/// Outcome of one liveness evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessVerdict {
    Healthy,
    /// Caller should send a probe and then call `mark_probe_sent`.
    ProbeDue,
    Dead(Fault),
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        LivenessMonitor { config }
    }

    pub fn evaluate(&self, hb: &mut HeartbeatState, now: f64) -> LivenessVerdict {
        let silent = now - hb.last_activity_at;
        if silent >= self.config.soft_wd_interval_secs {
            warn!("[HB] Watchdog: silent for {:.1}s", silent);
            return LivenessVerdict::Dead(Fault::WatchdogTimeout { silent_secs: silent });
        }

        if hb.awaiting_reply && now - hb.last_probe_at >= self.config.hb_timeout_secs {
            hb.awaiting_reply = false;
            hb.missed_replies = hb.missed_replies.saturating_add(1);
            warn!("[HB] Probe timed out ({}/{})", hb.missed_replies, self.config.hb_max_misses);

            if hb.missed_replies >= self.config.hb_max_misses {
                return LivenessVerdict::Dead(Fault::ProbeTimeout { missed: hb.missed_replies });
            }
        }

        if !hb.awaiting_reply && now - hb.last_probe_at >= self.config.hb_interval_secs {
            return LivenessVerdict::ProbeDue;
        }

        LivenessVerdict::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> LivenessMonitor {
        LivenessMonitor::new(LivenessConfig {
            hb_interval_secs: 5.0,
            hb_timeout_secs: 3.0,
            hb_max_misses: 2,
            soft_wd_interval_secs: 30.0,
        })
    }

    #[test]
    fn test_probe_due_after_interval() {
        let mon = monitor();
        let mut hb = HeartbeatState::new(0.0);
        assert_eq!(mon.evaluate(&mut hb, 4.9), LivenessVerdict::Healthy);
        assert_eq!(mon.evaluate(&mut hb, 5.0), LivenessVerdict::ProbeDue);
    }

    #[test]
    fn test_no_second_probe_while_awaiting() {
        let mon = monitor();
        let mut hb = HeartbeatState::new(0.0);
        hb.mark_probe_sent(5.0);
        hb.on_activity(6.0);
        assert_eq!(mon.evaluate(&mut hb, 7.9), LivenessVerdict::Healthy);
        assert!(hb.awaiting_reply);
    }

    #[test]
    fn test_reply_resets_misses() {
        let mon = monitor();
        let mut hb = HeartbeatState::new(0.0);
        hb.mark_probe_sent(5.0);
        assert_eq!(mon.evaluate(&mut hb, 8.0), LivenessVerdict::Healthy);
        assert_eq!(hb.missed_replies, 1);

        hb.mark_probe_sent(10.0);
        hb.on_reply(10.2);
        assert_eq!(hb.missed_replies, 0);
        assert!(!hb.awaiting_reply);
        assert_eq!(mon.evaluate(&mut hb, 11.0), LivenessVerdict::Healthy);
    }

    #[test]
    fn test_late_reply_keeps_miss() {
        let mon = monitor();
        let mut hb = HeartbeatState::new(0.0);
        hb.mark_probe_sent(5.0);
        assert_eq!(mon.evaluate(&mut hb, 8.0), LivenessVerdict::Healthy);
        assert_eq!(hb.missed_replies, 1);

        // Reply to the timed-out heartbeat
        hb.on_reply(9.0);
        assert_eq!(hb.missed_replies, 1);
        assert_eq!(hb.last_activity_at, 9.0);

        assert_eq!(mon.evaluate(&mut hb, 10.0), LivenessVerdict::ProbeDue);
        hb.mark_probe_sent(10.0);
        assert_eq!(
            mon.evaluate(&mut hb, 13.0),
            LivenessVerdict::Dead(Fault::ProbeTimeout { missed: 2 })
        );
    }

    #[test]
    fn test_unsolicited_reply_is_only_activity() {
        let mut hb = HeartbeatState::new(0.0);
        hb.missed_replies = 1;
        hb.on_reply(2.0);
        assert_eq!(hb.missed_replies, 1);
        assert!(!hb.awaiting_reply);
        assert_eq!(hb.last_activity_at, 2.0);
    }

    #[test]
    fn test_two_misses_kill_session() {
        let mon = monitor();
        let mut hb = HeartbeatState::new(0.0);

        assert_eq!(mon.evaluate(&mut hb, 5.0), LivenessVerdict::ProbeDue);
        hb.mark_probe_sent(5.0);
        assert_eq!(mon.evaluate(&mut hb, 8.0), LivenessVerdict::Healthy);

        assert_eq!(mon.evaluate(&mut hb, 10.0), LivenessVerdict::ProbeDue);
        hb.mark_probe_sent(10.0);
        assert_eq!(
            mon.evaluate(&mut hb, 13.0),
            LivenessVerdict::Dead(Fault::ProbeTimeout { missed: 2 })
        );
    }

    #[test]
    fn test_watchdog_with_stuck_reply_path() {
        // Probe timeout longer than the watchdog: the heartbeat detector never trips.
        let mon = LivenessMonitor::new(LivenessConfig {
            hb_interval_secs: 5.0,
            hb_timeout_secs: 120.0,
            hb_max_misses: 2,
            soft_wd_interval_secs: 30.0,
        });
        let mut hb = HeartbeatState::new(0.0);
        hb.mark_probe_sent(5.0);

        assert_eq!(mon.evaluate(&mut hb, 29.0), LivenessVerdict::Healthy);
        assert!(matches!(
            mon.evaluate(&mut hb, 30.0),
            LivenessVerdict::Dead(Fault::WatchdogTimeout { .. })
        ));
    }

    #[test]
    fn test_activity_defers_watchdog() {
        let mon = LivenessMonitor::new(LivenessConfig {
            hb_interval_secs: 5.0,
            hb_timeout_secs: 120.0,
            hb_max_misses: 2,
            soft_wd_interval_secs: 30.0,
        });
        let mut hb = HeartbeatState::new(0.0);
        hb.mark_probe_sent(5.0);
        hb.on_activity(25.0);

        assert_eq!(mon.evaluate(&mut hb, 40.0), LivenessVerdict::Healthy);
        assert!(matches!(mon.evaluate(&mut hb, 55.0), LivenessVerdict::Dead(_)));
    }
}
