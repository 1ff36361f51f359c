//! Channel payloads.
//!
//! Every text message is a JSON record with a `type` discriminator. Inbound we
//! only understand `sync`, `capture` and `status`; anything else is ignored so
//! the server can add message kinds without breaking older nodes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("time field is not finite")]
    NonFiniteTime,
}

/// One parsed server command.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    Sync { server_time: f64 },
    Capture { target_time: f64 },
    StatusRequest,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireInbound {
    Sync { time: f64 },
    Capture { time: f64 },
    Status,
    #[serde(other)]
    Unknown,
}

impl InboundCommand {
    /// Ok(None) for well-formed messages of a type this node doesn't handle.
    pub fn parse(raw: &[u8]) -> Result<Option<InboundCommand>, ProtocolError> {
        let wire: WireInbound = serde_json::from_slice(raw)?;
        let cmd = match wire {
            WireInbound::Sync { time } => InboundCommand::Sync { server_time: finite(time)? },
            WireInbound::Capture { time } => InboundCommand::Capture { target_time: finite(time)? },
            WireInbound::Status => InboundCommand::StatusRequest,
            WireInbound::Unknown => return Ok(None),
        };
        Ok(Some(cmd))
    }
}

fn finite(time: f64) -> Result<f64, ProtocolError> {
    if time.is_finite() {
        Ok(time)
    } else {
        Err(ProtocolError::NonFiniteTime)
    }
}

/// Fields attached to every outbound record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub device_id: String,
    pub mac: String,
    pub firmware_version: String,
    pub board_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Hello {
        #[serde(flatten)]
        identity: Identity,
        rssi: Option<i32>,
    },
    CaptureMetadata {
        #[serde(flatten)]
        identity: Identity,
        rssi: Option<i32>,
        resolution: String,
        jpeg_quality: u8,
        image_size: usize,
    },
    Status {
        #[serde(flatten)]
        identity: Identity,
        rssi: Option<i32>,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Hello { .. } => "hello",
            OutboundMessage::CaptureMetadata { .. } => "capture_metadata",
            OutboundMessage::Status { .. } => "status",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn identity() -> Identity {
        Identity {
            device_id: "cam-01".to_string(),
            mac: "D8:79:A9:A0:ED:30".to_string(),
            firmware_version: "0.3.0".to_string(),
            board_type: "AI_THINKER".to_string(),
        }
    }

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(
            InboundCommand::parse(br#"{"type":"sync","time":1000.5}"#).unwrap(),
            Some(InboundCommand::Sync { server_time: 1000.5 })
        );
        assert_eq!(
            InboundCommand::parse(br#"{"type":"capture","time":1005.2}"#).unwrap(),
            Some(InboundCommand::Capture { target_time: 1005.2 })
        );
        assert_eq!(
            InboundCommand::parse(br#"{"type":"status"}"#).unwrap(),
            Some(InboundCommand::StatusRequest)
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert_eq!(InboundCommand::parse(br#"{"type":"reboot","delay":3}"#).unwrap(), None);
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        assert!(InboundCommand::parse(b"not json").is_err());
        assert!(InboundCommand::parse(br#"{"time":1.0}"#).is_err());
        assert!(InboundCommand::parse(br#"{"type":"sync"}"#).is_err());
        assert!(InboundCommand::parse(br#"{"type":"capture","time":"soon"}"#).is_err());
    }

    #[test]
    fn test_hello_shape() {
        let msg = OutboundMessage::Hello { identity: identity(), rssi: Some(-58) };
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["device_id"], "cam-01");
        assert_eq!(v["board_type"], "AI_THINKER");
        assert_eq!(v["rssi"], -58);
    }

    #[test]
    fn test_capture_metadata_shape() {
        let msg = OutboundMessage::CaptureMetadata {
            identity: identity(),
            rssi: None,
            resolution: "SVGA".to_string(),
            jpeg_quality: 12,
            image_size: 48213,
        };
        assert_eq!(msg.kind(), "capture_metadata");
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "capture_metadata");
        assert_eq!(v["image_size"], 48213);
        assert_eq!(v["jpeg_quality"], 12);
        assert_eq!(v["mac"], "D8:79:A9:A0:ED:30");
        assert!(v["rssi"].is_null());
    }
}
