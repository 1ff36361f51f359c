use anyhow::Result;
use std::time::Duration;

use crate::config::Endpoint;

/// Radio association status, sampled once per tick.
#[cfg_attr(test, mockall::automock)]
pub trait LinkProbe {
    fn is_link_up(&self) -> bool;

    /// Signal quality in dBm, if the driver exposes one.
    fn signal_quality(&self) -> Option<i32> {
        None
    }
}

/// Progress of a non-blocking channel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Pending,
    Established,
}

/// Something the transport observed on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    /// Reply to a probe issued with `Channel::ping`.
    Pong,
    /// The peer pinged us. The transport has already answered it.
    Ping,
    /// Peer closed the channel or the socket failed.
    Closed,
}

#[cfg_attr(test, mockall::automock)]
pub trait Channel {
    /// Start a connection attempt. May complete immediately.
    fn connect(&mut self, endpoint: &Endpoint) -> Result<ConnectProgress>;

    /// Advance an outstanding attempt. An error means the handshake failed.
    fn poll_connect(&mut self) -> Result<ConnectProgress>;

    /// Receive one event. Returns Ok(None) when nothing is pending.
    fn poll(&mut self) -> Result<Option<ChannelEvent>>;

    fn send_text(&mut self, payload: &str) -> Result<()>;

    fn send_binary(&mut self, data: &[u8]) -> Result<()>;

    /// Transport-level liveness probe.
    fn ping(&mut self) -> Result<()>;

    /// Release the underlying resource. Idempotent.
    fn close(&mut self);
}

/// Settings reported alongside every captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub resolution: String,
    pub jpeg_quality: u8,
}

#[cfg_attr(test, mockall::automock)]
pub trait Camera {
    /// Grab one encoded frame.
    fn capture_now(&mut self) -> Result<Vec<u8>>;

    fn settings(&self) -> CameraSettings;
}

/// One hardware one-shot timer slot. Expiry raises the `FireSignal` the timer
/// was constructed with; it must not do anything else.
#[cfg_attr(test, mockall::automock)]
pub trait OneShotTimer {
    fn start_once(&mut self, delay: Duration) -> Result<()>;

    fn stop(&mut self);
}

/// Local monotonic time source in seconds since an arbitrary origin.
#[cfg_attr(test, mockall::automock)]
pub trait MonotonicClock {
    fn monotonic_secs(&self) -> f64;
}

#[cfg_attr(test, mockall::automock)]
pub trait FirmwareUpdater {
    /// Returns the newer version when one is published.
    fn check_for_update(&mut self) -> Result<Option<String>>;

    fn apply_update(&mut self, version: &str) -> Result<()>;
}
