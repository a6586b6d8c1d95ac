//! Wire shapes for the client<->server WebSocket protocol. Client messages
//! are tagged `{"type": ..., ...fields}`; server messages mirror the typed
//! event bus as `{"type": <event tag>, "data": <event payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure to turn a raw client frame into a [`ClientMessage`].
#[derive(Debug, Error)]
pub enum WsError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Chat { prompt: String },
    Stop,
    Ping,
    ClearHistory,
    Switch { provider: String },
    ResumeSession { session_id: String },
    NewSession,
    PermissionResponse { request_id: String, approved: bool },
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, WsError> {
        serde_json::from_str(raw).map_err(WsError::UnknownMessageType)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl ServerMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", serde_json::json!({ "message": message.into() }))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":{"message":"failed to serialize server message"}}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_message_by_tag() {
        let msg = ClientMessage::parse(r#"{"type": "chat", "prompt": "hello"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Chat { prompt } if prompt == "hello"));
    }

    #[test]
    fn parses_tagless_variants() {
        assert!(matches!(ClientMessage::parse(r#"{"type": "ping"}"#).unwrap(), ClientMessage::Ping));
        assert!(matches!(
            ClientMessage::parse(r#"{"type": "clear_history"}"#).unwrap(),
            ClientMessage::ClearHistory
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ClientMessage::parse(r#"{"type": "not_real"}"#).is_err());
    }

    #[test]
    fn error_message_round_trips_through_json() {
        let wire = ServerMessage::error("boom").to_json();
        assert!(wire.contains("\"type\":\"error\""));
        assert!(wire.contains("boom"));
    }
}
