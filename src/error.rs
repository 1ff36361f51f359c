use thiserror::Error;

/// Runtime faults the controller recovers from. Every one of them ends with the
/// session Closed and the next attempt governed by the retry backoff.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("link unavailable")]
    LinkUnavailable,
    #[error("channel handshake failed: {0}")]
    HandshakeFailure(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("{missed} heartbeat replies missed")]
    ProbeTimeout { missed: u32 },
    #[error("heartbeat probe could not be sent: {0}")]
    ProbeSendFailure(String),
    #[error("no activity for {silent_secs:.1}s")]
    WatchdogTimeout { silent_secs: f64 },
    #[error("channel closed by peer")]
    RemoteClosed,
    #[error("channel error: {0}")]
    TransportError(String),
    #[error("capture failed: {0}")]
    CaptureFailure(String),
}

/// Why an Open session was torn down.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    LinkLost,
    Fault(Fault),
    LocalRequest,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LinkLost => write!(f, "link lost"),
            CloseReason::Fault(fault) => write!(f, "{}", fault),
            CloseReason::LocalRequest => write!(f, "local request"),
        }
    }
}
