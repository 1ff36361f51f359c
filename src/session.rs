//! Session State Machine
//!
//! ```text
//!   Closed --(link up, backoff elapsed)--> Connecting
//!   Connecting --(handshake ok)--> Open
//!   Connecting --(handshake failed)--> Closed
//!   Open --(link down | liveness failure | remote close | local request)--> Closed
//! ```
//!
//! Backoff is a fixed minimum gap between attempts measured from the start of
//! the previous attempt. Closing never touches `last_attempt_at`, so the next
//! attempt is always governed by the same timer regardless of why the session
//! died.

use log::{debug, info, warn};

use crate::error::CloseReason;
use crate::liveness::HeartbeatState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Closed => "CLOSED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Open => "OPEN",
        }
    }
}

/// Inputs to the state machine, fed synchronously from the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LinkUp,
    LinkDown,
    SessionOpened,
    SessionClosed(CloseReason),
    ProbeReply,
    MessageReceived,
}

/// Side effect the caller must carry out after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    None,
    /// Issue a connection attempt.
    Connect,
    /// Session just opened; announce ourselves.
    SendHello,
    /// Release the channel.
    Teardown(CloseReason),
}

#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    retry_backoff_secs: f64,
    last_attempt_at: Option<f64>,
    heartbeat: Option<HeartbeatState>,
    attempts: u64,
    opened_at: Option<f64>,
}

impl SessionMachine {
    pub fn new(retry_backoff_secs: f64) -> Self {
        SessionMachine {
            state: SessionState::Closed,
            retry_backoff_secs,
            last_attempt_at: None,
            heartbeat: None,
            attempts: 0,
            opened_at: None,
        }
    }

    pub fn handle(&mut self, event: SessionEvent, now: f64) -> SessionAction {
        match (self.state, event) {
            (SessionState::Closed, SessionEvent::LinkUp) => {
                if !self.backoff_elapsed(now) {
                    return SessionAction::None;
                }
                self.state = SessionState::Connecting;
                self.last_attempt_at = Some(now);
                self.attempts += 1;
                info!("[SESSION] Connecting (attempt {})", self.attempts);
                SessionAction::Connect
            }

            (SessionState::Open, SessionEvent::LinkDown) => {
                self.close(CloseReason::LinkLost)
            }

            (SessionState::Connecting, SessionEvent::SessionOpened) => {
                self.state = SessionState::Open;
                self.heartbeat = Some(HeartbeatState::new(now));
                self.opened_at = Some(now);
                info!("[SESSION] Open");
                SessionAction::SendHello
            }

            (SessionState::Connecting, SessionEvent::SessionClosed(reason)) => {
                warn!("[SESSION] Connect failed: {}", reason);
                self.state = SessionState::Closed;
                SessionAction::Teardown(reason)
            }

            (SessionState::Open, SessionEvent::SessionClosed(reason)) => self.close(reason),

            (SessionState::Open, SessionEvent::ProbeReply) => {
                if let Some(hb) = self.heartbeat.as_mut() {
                    hb.on_reply(now);
                }
                SessionAction::None
            }

            (SessionState::Open, SessionEvent::MessageReceived) => {
                if let Some(hb) = self.heartbeat.as_mut() {
                    hb.on_activity(now);
                }
                SessionAction::None
            }

            (state, event) => {
                debug!("[SESSION] {:?} ignored in {}", event, state.as_str());
                SessionAction::None
            }
        }
    }

    fn close(&mut self, reason: CloseReason) -> SessionAction {
        let opened_at = self.opened_at.take().unwrap_or(0.0);
        warn!("[SESSION] Closed: {} (attempt {}, opened at {:.1}s)", reason, self.attempts, opened_at);
        self.state = SessionState::Closed;
        self.heartbeat = None;
        SessionAction::Teardown(reason)
    }

    fn backoff_elapsed(&self, now: f64) -> bool {
        match self.last_attempt_at {
            Some(last) => now - last >= self.retry_backoff_secs,
            None => true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn heartbeat(&self) -> Option<&HeartbeatState> {
        self.heartbeat.as_ref()
    }

    pub fn heartbeat_mut(&mut self) -> Option<&mut HeartbeatState> {
        self.heartbeat.as_mut()
    }

    pub fn last_attempt_at(&self) -> Option<f64> {
        self.last_attempt_at
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}
