use serde::{Deserialize, Serialize};

/// Snapshot of controller state, shared with readers outside the control loop.
///
/// Written once per tick under a short write lock. Readers (status logging,
/// tests) only ever take read locks.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeStatus {
    /// True when the radio association is usable
    pub link_up: bool,

    /// Session state: "CLOSED", "CONNECTING" or "OPEN"
    pub session: String,

    /// Connection attempts since boot
    pub connect_attempts: u64,

    /// Server time minus local monotonic time (seconds)
    pub clock_offset_s: f64,

    /// True once at least one sync message has been applied
    pub clock_synced: bool,

    /// True while a deferred capture is armed
    pub capture_pending: bool,

    /// Captures taken since boot (immediate and deferred)
    pub captures_taken: u64,

    /// Heartbeat replies currently missed on the open session
    pub missed_replies: u32,

    /// Last signal quality reading (dBm)
    pub rssi: Option<i32>,

    /// Local monotonic time of the last update (seconds)
    pub updated_at: f64,
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus {
            link_up: false,
            session: "CLOSED".to_string(),
            connect_attempts: 0,
            clock_offset_s: 0.0,
            clock_synced: false,
            capture_pending: false,
            captures_taken: 0,
            missed_replies: 0,
            rssi: None,
            updated_at: 0.0,
        }
    }
}
