//! Wire envelope for client-facing connections
//!
//! Every message crossing a client connection is a JSON envelope with a
//! type tag, an opaque payload and a server-side timestamp. The reserved
//! types (`ping`, `pong`, `connection_established`, `error`) belong to the
//! connection layer; everything else is application traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved envelope types handled by the connection layer
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_CONNECTION_ESTABLISHED: &str = "connection_established";
pub const TYPE_ERROR: &str = "error";
/// Consumed by the WebSocket front to bind a socket to a user
pub const TYPE_IDENTIFY: &str = "identify";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn ping() -> Self {
        Self::new(TYPE_PING, serde_json::Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(TYPE_PONG, serde_json::Value::Null)
    }

    pub fn connection_established(user_id: &str, channels: &[String]) -> Self {
        Self::new(
            TYPE_CONNECTION_ESTABLISHED,
            serde_json::json!({ "user_id": user_id, "channels": channels }),
        )
    }

    pub fn error(message: &str) -> Self {
        Self::new(TYPE_ERROR, serde_json::json!({ "message": message }))
    }

    pub fn is_heartbeat_ack(&self) -> bool {
        self.kind == TYPE_PONG || self.kind == TYPE_PING
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_type_tag() {
        let env = Envelope::new("chat_message", serde_json::json!({"text": "hi"}));
        let raw = env.to_json().unwrap();
        assert!(raw.contains("\"type\":\"chat_message\""));

        let back = Envelope::from_json(&raw).unwrap();
        assert_eq!(back.kind, "chat_message");
        assert_eq!(back.data["text"], "hi");
    }

    #[test]
    fn missing_fields_get_defaults() {
        let back = Envelope::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(back.kind, TYPE_PING);
        assert!(back.data.is_null());
        assert!(back.is_heartbeat_ack());
    }
}
