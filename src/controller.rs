//! Node Controller - the cooperative control loop of a camera node
//!
//! One call to `process_loop_iteration` is one tick:
//! 1. **Fire**: run the deferred capture if its timer raised the signal
//! 2. **Inbound**: drain channel events in arrival order, dispatching commands
//! 3. **Link**: re-sample the radio association
//! 4. **Session**: feed the link state to the session machine, advance any
//!    outstanding handshake
//! 5. **Liveness**: heartbeat and watchdog on the open session
//!
//! Nothing in a tick blocks on I/O. Every runtime fault ends with the session
//! Closed and the next connect attempt gated by the retry backoff.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::{Arc, RwLock};

use crate::clock_sync::ClockSynchronizer;
use crate::config::SystemConfig;
use crate::dispatcher::{CommandDispatcher, CommandHandler, DispatchStats};
use crate::error::{CloseReason, Fault};
use crate::link::{LinkMonitor, LinkState};
use crate::liveness::{LivenessMonitor, LivenessVerdict};
use crate::protocol::{Identity, OutboundMessage};
use crate::scheduler::{CaptureDecision, CaptureScheduler};
use crate::session::{SessionAction, SessionEvent, SessionMachine, SessionState};
use crate::status::NodeStatus;
use crate::timer::FireSignal;
use crate::traits::{Camera, Channel, ChannelEvent, ConnectProgress, LinkProbe, MonotonicClock, OneShotTimer};

// Bound on inbound events handled per tick so a chatty server can't starve
// the link and liveness checks.
const MAX_EVENTS_PER_TICK: usize = 32;

/// Main camera node controller
pub struct NodeController<L, N, K, T, M>
where
    L: LinkProbe,
    N: Channel,
    K: Camera,
    T: OneShotTimer,
    M: MonotonicClock,
{
    // Collaborators
    link: LinkMonitor<L>,
    channel: N,
    camera: K,
    clock: M,
    config: SystemConfig,
    identity: Identity,

    // Core state
    session: SessionMachine,
    liveness: LivenessMonitor,
    clock_sync: ClockSynchronizer,
    scheduler: CaptureScheduler<T>,
    dispatcher: CommandDispatcher,
    link_state: LinkState,

    // Metrics
    captures_taken: u64,
    status_shared: Arc<RwLock<NodeStatus>>,
}

impl<L, N, K, T, M> NodeController<L, N, K, T, M>
where
    L: LinkProbe,
    N: Channel,
    K: Camera,
    T: OneShotTimer,
    M: MonotonicClock,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link_probe: L,
        channel: N,
        camera: K,
        timer: T,
        signal: FireSignal,
        clock: M,
        identity: Identity,
        status_shared: Arc<RwLock<NodeStatus>>,
        config: SystemConfig,
    ) -> Self {
        info!("=== Camera Node Controller ===");
        info!("Device: {} ({}, fw {})", identity.device_id, identity.board_type, identity.firmware_version);
        info!("Server: {}:{}", config.server.host, config.server.port);
        info!("Backoff: {:.1}s  Heartbeat: {:.1}s/{:.1}s x{}  Watchdog: {:.1}s",
              config.session.retry_backoff_secs,
              config.liveness.hb_interval_secs,
              config.liveness.hb_timeout_secs,
              config.liveness.hb_max_misses,
              config.liveness.soft_wd_interval_secs);

        NodeController {
            link: LinkMonitor::new(link_probe),
            channel,
            camera,
            clock,
            identity,
            session: SessionMachine::new(config.session.retry_backoff_secs),
            liveness: LivenessMonitor::new(config.liveness.clone()),
            clock_sync: ClockSynchronizer::new(),
            scheduler: CaptureScheduler::new(timer, signal, config.capture.late_tolerance_secs),
            dispatcher: CommandDispatcher::new(),
            link_state: LinkState::Down,
            captures_taken: 0,
            status_shared,
            config,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn get_status_shared(&self) -> Arc<RwLock<NodeStatus>> {
        self.status_shared.clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn clock_sync(&self) -> &ClockSynchronizer {
        &self.clock_sync
    }

    pub fn pending_capture(&self) -> Option<f64> {
        self.scheduler.pending()
    }

    pub fn captures_taken(&self) -> u64 {
        self.captures_taken
    }

    pub fn dispatch_stats(&self) -> &DispatchStats {
        self.dispatcher.stats()
    }

    pub fn process_loop_iteration(&mut self) -> Result<()> {
        if self.scheduler.take_fired() {
            self.run_capture();
        }

        self.poll_channel();

        let now = self.clock.monotonic_secs();
        self.link_state = self.link.sample();
        let link_event = match self.link_state {
            LinkState::Up => SessionEvent::LinkUp,
            LinkState::Down => SessionEvent::LinkDown,
        };
        let action = self.session.handle(link_event, now);
        self.apply(action);

        if self.session.state() == SessionState::Connecting {
            self.advance_handshake();
        }

        self.evaluate_liveness();
        self.update_shared_status();
        Ok(())
    }

    /// Close the session on local request. The backoff timer is untouched.
    pub fn request_close(&mut self) {
        let now = self.clock.monotonic_secs();
        let action = self.session.handle(SessionEvent::SessionClosed(CloseReason::LocalRequest), now);
        self.apply(action);
        self.update_shared_status();
    }

    pub fn log_status(&self) {
        let hb = self.session.heartbeat();
        info!("[STATUS] link:{} session:{} offset:{:.3}s{} pending:{} captures:{} missed:{}",
              if self.link_state.is_up() { "UP" } else { "DOWN" },
              self.session.state().as_str(),
              self.clock_sync.offset(),
              if self.clock_sync.is_synced() { "" } else { " (unsynced)" },
              self.scheduler.pending().is_some(),
              self.captures_taken,
              hb.map(|h| h.missed_replies).unwrap_or(0));
        self.update_shared_status();
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    fn apply(&mut self, action: SessionAction) {
        match action {
            SessionAction::None => {}
            SessionAction::Connect => self.start_connect(),
            SessionAction::SendHello => {
                let hello = OutboundMessage::Hello {
                    identity: self.identity.clone(),
                    rssi: self.link.signal_quality(),
                };
                self.send_message(&hello);
            }
            SessionAction::Teardown(reason) => {
                debug!("[SESSION] Releasing channel ({})", reason);
                self.channel.close();
            }
        }
    }

    fn start_connect(&mut self) {
        let result = self.channel.connect(&self.config.server);
        self.on_connect_progress(result);
    }

    fn advance_handshake(&mut self) {
        let result = self.channel.poll_connect();
        self.on_connect_progress(result);
    }

    fn on_connect_progress(&mut self, result: Result<ConnectProgress>) {
        let now = self.clock.monotonic_secs();
        let event = match result {
            Ok(ConnectProgress::Pending) => return,
            Ok(ConnectProgress::Established) => SessionEvent::SessionOpened,
            Err(e) => SessionEvent::SessionClosed(CloseReason::Fault(Fault::HandshakeFailure(e.to_string()))),
        };
        let action = self.session.handle(event, now);
        self.apply(action);
    }

    fn close_with(&mut self, fault: Fault) {
        let now = self.clock.monotonic_secs();
        let action = self.session.handle(SessionEvent::SessionClosed(CloseReason::Fault(fault)), now);
        self.apply(action);
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    fn poll_channel(&mut self) {
        for _ in 0..MAX_EVENTS_PER_TICK {
            if !self.session.is_open() {
                return;
            }

            let event = match self.channel.poll() {
                Ok(Some(ev)) => ev,
                Ok(None) => return,
                Err(e) => {
                    self.close_with(Fault::TransportError(e.to_string()));
                    return;
                }
            };

            let now = self.clock.monotonic_secs();
            match event {
                ChannelEvent::Text(raw) => {
                    self.session.handle(SessionEvent::MessageReceived, now);
                    let mut dispatcher = std::mem::take(&mut self.dispatcher);
                    dispatcher.on_message(&raw, self);
                    self.dispatcher = dispatcher;
                }
                ChannelEvent::Binary(data) => {
                    self.session.handle(SessionEvent::MessageReceived, now);
                    debug!("Ignoring {} byte binary message", data.len());
                }
                ChannelEvent::Pong => {
                    self.session.handle(SessionEvent::ProbeReply, now);
                }
                ChannelEvent::Ping => {
                    self.session.handle(SessionEvent::MessageReceived, now);
                }
                ChannelEvent::Closed => {
                    self.close_with(Fault::RemoteClosed);
                    return;
                }
            }
        }
    }

    // ========================================================================
    // LIVENESS
    // ========================================================================

    fn evaluate_liveness(&mut self) {
        let now = self.clock.monotonic_secs();
        let verdict = match self.session.heartbeat_mut() {
            Some(hb) => self.liveness.evaluate(hb, now),
            None => return,
        };

        match verdict {
            LivenessVerdict::Healthy => {}
            LivenessVerdict::ProbeDue => match self.channel.ping() {
                Ok(()) => {
                    if let Some(hb) = self.session.heartbeat_mut() {
                        hb.mark_probe_sent(now);
                    }
                    debug!("[HB] Probe sent");
                }
                Err(e) => self.close_with(Fault::ProbeSendFailure(e.to_string())),
            },
            LivenessVerdict::Dead(fault) => self.close_with(fault),
        }
    }

    // ========================================================================
    // CAPTURE & TELEMETRY
    // ========================================================================

    /// Grab a frame and ship it with its metadata. Failures are logged and
    /// never affect the session.
    fn run_capture(&mut self) {
        info!("[CAPTURE] Capturing...");
        let image = match self.camera.capture_now() {
            Ok(image) => image,
            Err(e) => {
                warn!("[CAPTURE] {}", Fault::CaptureFailure(e.to_string()));
                return;
            }
        };
        self.captures_taken += 1;
        let image_size = image.len();
        info!("[CAPTURE] Image captured: {} bytes", image_size);

        if !self.session.is_open() {
            warn!("[CAPTURE] Session not open, frame not delivered");
            return;
        }
        if let Err(e) = self.channel.send_binary(&image) {
            warn!("[CAPTURE] Failed to send image: {}", e);
            return;
        }

        let settings = self.camera.settings();
        let metadata = OutboundMessage::CaptureMetadata {
            identity: self.identity.clone(),
            rssi: self.link.signal_quality(),
            resolution: settings.resolution,
            jpeg_quality: settings.jpeg_quality,
            image_size,
        };
        self.send_message(&metadata);
    }

    fn send_message(&mut self, msg: &OutboundMessage) -> bool {
        if !self.session.is_open() {
            debug!("Session not open, {} not sent", msg.kind());
            return false;
        }
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {}: {}", msg.kind(), e);
                return false;
            }
        };
        match self.channel.send_text(&json) {
            Ok(()) => {
                debug!("Sent {}", msg.kind());
                true
            }
            Err(e) => {
                warn!("Failed to send {}: {}", msg.kind(), e);
                false
            }
        }
    }

    // ========================================================================
    // UTILITY METHODS
    // ========================================================================

    fn update_shared_status(&self) {
        if let Ok(mut status) = self.status_shared.write() {
            status.link_up = self.link_state.is_up();
            status.session = self.session.state().as_str().to_string();
            status.connect_attempts = self.session.attempts();
            status.clock_offset_s = self.clock_sync.offset();
            status.clock_synced = self.clock_sync.is_synced();
            status.capture_pending = self.scheduler.pending().is_some();
            status.captures_taken = self.captures_taken;
            status.missed_replies = self.session.heartbeat().map(|h| h.missed_replies).unwrap_or(0);
            status.rssi = self.link.signal_quality();
            status.updated_at = self.clock.monotonic_secs();
        }
    }
}

impl<L, N, K, T, M> CommandHandler for NodeController<L, N, K, T, M>
where
    L: LinkProbe,
    N: Channel,
    K: Camera,
    T: OneShotTimer,
    M: MonotonicClock,
{
    fn on_sync(&mut self, server_time: f64) {
        let now = self.clock.monotonic_secs();
        self.clock_sync.on_sync(server_time, now);
    }

    fn on_capture(&mut self, target_time: f64) {
        let now = self.clock.monotonic_secs();
        match self.scheduler.on_capture_command(target_time, &self.clock_sync, now) {
            Ok(CaptureDecision::Immediate) => self.run_capture(),
            Ok(CaptureDecision::Deferred { .. }) => {}
            Err(e) => warn!("[CAPTURE] Could not arm timer: {}", e),
        }
    }

    fn on_status_request(&mut self) {
        let status = OutboundMessage::Status {
            identity: self.identity.clone(),
            rssi: self.link.signal_quality(),
        };
        self.send_message(&status);
    }
}
