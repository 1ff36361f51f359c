//! Link Monitor - samples radio association state once per tick.

use log::{info, warn};

use crate::traits::LinkProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        self == LinkState::Up
    }
}

pub struct LinkMonitor<L: LinkProbe> {
    probe: L,
    // Only used to log edges; the state itself is re-sampled every tick.
    last_logged: Option<LinkState>,
}

impl<L: LinkProbe> LinkMonitor<L> {
    pub fn new(probe: L) -> Self {
        LinkMonitor { probe, last_logged: None }
    }

    /// Read the current association state from the driver.
    pub fn sample(&mut self) -> LinkState {
        let state = if self.probe.is_link_up() { LinkState::Up } else { LinkState::Down };

        if self.last_logged != Some(state) {
            match state {
                LinkState::Up => match self.probe.signal_quality() {
                    Some(rssi) => info!("[LINK] Up (RSSI {} dBm)", rssi),
                    None => info!("[LINK] Up"),
                },
                LinkState::Down => warn!("[LINK] Down"),
            }
            self.last_logged = Some(state);
        }

        state
    }

    pub fn signal_quality(&self) -> Option<i32> {
        self.probe.signal_quality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockLinkProbe;
    use mockall::Sequence;

    #[test]
    fn test_sample_is_not_cached() {
        let mut probe = MockLinkProbe::new();
        let mut seq = Sequence::new();
        probe.expect_is_link_up().times(1).in_sequence(&mut seq).return_const(true);
        probe.expect_is_link_up().times(1).in_sequence(&mut seq).return_const(false);
        probe.expect_is_link_up().times(1).in_sequence(&mut seq).return_const(true);
        probe.expect_signal_quality().return_const(Some(-61));

        let mut monitor = LinkMonitor::new(probe);
        assert_eq!(monitor.sample(), LinkState::Up);
        assert_eq!(monitor.sample(), LinkState::Down);
        assert_eq!(monitor.sample(), LinkState::Up);
    }

    #[test]
    fn test_signal_quality_passthrough() {
        let mut probe = MockLinkProbe::new();
        probe.expect_signal_quality().return_const(None);
        let monitor = LinkMonitor::new(probe);
        assert_eq!(monitor.signal_quality(), None);
    }
}
