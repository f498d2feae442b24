//! Control-plane records exchanged during hole punching.
//!
//! Messages are JSON so captures stay debuggable and unknown fields from
//! newer versions are tolerated.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Announces presence and initiates punching.
    Hello,
    /// Confirms reachability in response to a hello.
    Ack,
}

/// A small control record exchanged during NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Identifies the sender.
    pub peer_id: String,

    /// The self-identifier the sender expects at the recipient. Absent when
    /// the sender does not yet know who it is talking to; when present it is
    /// used to filter stray handshakes and to route to a per-addressee
    /// control channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer_id: Option<String>,

    /// Unix nanoseconds at send time, usable for freshness checks.
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

impl Message {
    pub fn new(kind: MessageType, peer_id: &str, to_peer_id: Option<&str>) -> Self {
        Self {
            kind,
            peer_id: peer_id.to_string(),
            to_peer_id: to_peer_id.map(|s| s.to_string()),
            timestamp: unix_nanos(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| Error::InvalidMessage)
    }

    pub fn decode(data: &[u8]) -> Result<Message> {
        serde_json::from_slice(data).map_err(|_| Error::InvalidMessage)
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = Message::new(MessageType::Hello, "peer-a", Some("peer-b"));
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageType::Hello);
        assert_eq!(decoded.peer_id, "peer-a");
        assert_eq!(decoded.to_peer_id.as_deref(), Some("peer-b"));
        assert_eq!(decoded.timestamp, msg.timestamp);
    }

    #[test]
    fn message_omits_missing_addressee() {
        let msg = Message::new(MessageType::Ack, "peer-a", None);
        let json = msg.encode().unwrap();
        assert!(!String::from_utf8(json.clone()).unwrap().contains("to_peer_id"));
        let decoded = Message::decode(&json).unwrap();
        assert_eq!(decoded.to_peer_id, None);
    }

    #[test]
    fn message_wire_names_are_stable() {
        let msg = Message::new(MessageType::Hello, "p", None);
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"hello\""));
        assert!(json.contains("\"ts\":"));
    }

    #[test]
    fn message_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not json"),
            Err(Error::InvalidMessage)
        ));
    }
}
