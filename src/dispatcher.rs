//! Command Dispatcher - routes inbound text messages to their handlers.
//!
//! Parse failures are logged and dropped. They never propagate as a fault and
//! never touch session state.

use log::{debug, warn};

use crate::protocol::InboundCommand;

/// Receivers for each command kind. Implemented by the controller.
#[cfg_attr(test, mockall::automock)]
pub trait CommandHandler {
    fn on_sync(&mut self, server_time: f64);
    fn on_capture(&mut self, target_time: f64);
    fn on_status_request(&mut self);
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub malformed: u64,
    pub ignored: u64,
}

#[derive(Debug, Default)]
pub struct CommandDispatcher {
    stats: DispatchStats,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the command that was dispatched, if any.
    pub fn on_message<H: CommandHandler>(&mut self, raw: &[u8], handler: &mut H) -> Option<InboundCommand> {
        let cmd = match InboundCommand::parse(raw) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                debug!("Ignoring message of unknown type");
                self.stats.ignored += 1;
                return None;
            }
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                self.stats.malformed += 1;
                return None;
            }
        };

        match cmd {
            InboundCommand::Sync { server_time } => handler.on_sync(server_time),
            InboundCommand::Capture { target_time } => handler.on_capture(target_time),
            InboundCommand::StatusRequest => handler.on_status_request(),
        }
        self.stats.dispatched += 1;

        Some(cmd)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}
