//! Clock Synchronizer - maps local monotonic time onto server absolute time.
//!
//! A single additive offset is kept: `server_now = local_monotonic + offset`.
//! Every sync message replaces it outright; the server resends periodically so
//! error between syncs stays bounded. Before the first sync the offset is zero
//! and scheduling runs on uncorrected local time.

use log::{debug, info};

#[derive(Debug, Default, Clone)]
pub struct ClockSynchronizer {
    offset_secs: f64,
    synced: bool,
    sync_count: u64,
}

impl ClockSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sync(&mut self, server_time: f64, local_now: f64) {
        let offset = server_time - local_now;
        let step = offset - self.offset_secs;

        if self.synced {
            debug!("[SYNC] offset:{:.3}s step:{:+.3}ms", offset, step * 1000.0);
        } else {
            info!("[SYNC] First sync, offset {:.3}s", offset);
        }

        self.offset_secs = offset;
        self.synced = true;
        self.sync_count += 1;
    }

    /// Current server absolute time as seen from this node.
    pub fn now(&self, local_now: f64) -> f64 {
        local_now + self.offset_secs
    }

    pub fn offset(&self) -> f64 {
        self.offset_secs
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }
}
