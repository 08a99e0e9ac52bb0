//! JSON wire protocol for roster synchronization.
//!
//! Client → hub:
//! ```text
//! { "type": "load" | "save" | "loadSettings" | "saveSettings",
//!   "data"?: <Roster | PublicSettings | sealed string> }
//! ```
//! Hub → client:
//! ```text
//! { "type": "attendees",      "data": <Roster | sealed string> }
//! { "type": "publicSettings", "data": <PublicSettings | sealed string> }
//! ```
//!
//! Inbound frames pass three gates in order: size, JSON syntax, then
//! [`crate::validate::Validator`]. The first two are fatal to the connection,
//! the last is not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Payload, PublicSettings, Roster};

/// Largest inbound frame the hub will parse.
pub const MAX_MESSAGE_BYTES: usize = 100_000;

/// The four request kinds a client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Load,
    Save,
    LoadSettings,
    SaveSettings,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Load,
        MessageType::Save,
        MessageType::LoadSettings,
        MessageType::SaveSettings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Load => "load",
            MessageType::Save => "save",
            MessageType::LoadSettings => "loadSettings",
            MessageType::SaveSettings => "saveSettings",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Whether the request carries a `data` payload.
    pub fn carries_data(self) -> bool {
        matches!(self, MessageType::Save | MessageType::SaveSettings)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Load,
    Save(Payload<Roster>),
    LoadSettings,
    SaveSettings(Payload<PublicSettings>),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Load => MessageType::Load,
            ClientMessage::Save(_) => MessageType::Save,
            ClientMessage::LoadSettings => MessageType::LoadSettings,
            ClientMessage::SaveSettings(_) => MessageType::SaveSettings,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Response kinds sent by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Attendees,
    PublicSettings,
}

/// A hub → client message. Replies and broadcasts share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "attendees")]
    Attendees(Payload<Roster>),
    #[serde(rename = "publicSettings")]
    PublicSettings(Payload<PublicSettings>),
}

impl ServerMessage {
    pub fn response_type(&self) -> ResponseType {
        match self {
            ServerMessage::Attendees(_) => ResponseType::Attendees,
            ServerMessage::PublicSettings(_) => ResponseType::PublicSettings,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Why the hub closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RateLimited,
    TooLarge,
    ServerError,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::RateLimited => 1008,
            CloseReason::TooLarge => 1009,
            CloseReason::ServerError => 1011,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::RateLimited => "Rate limit exceeded",
            CloseReason::TooLarge => "Message too large",
            CloseReason::ServerError => "Server error",
        }
    }
}

/// Fatal framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProtocolError::TooLarge { .. } => CloseReason::TooLarge,
            _ => CloseReason::ServerError,
        }
    }
}

/// Size-check then parse an inbound frame.
///
/// The size check runs on the raw bytes before any parsing work is done.
/// Text and binary frames go through the same path; invalid UTF-8 is
/// reported as malformed JSON.
pub fn parse_frame(raw: &[u8], limit: usize) -> Result<Value, ProtocolError> {
    if raw.len() > limit {
        return Err(ProtocolError::TooLarge { size: raw.len(), limit });
    }
    serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttendanceRecord;

    #[test]
    fn test_message_type_names() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("delete"), None);
        assert_eq!(MessageType::parse("Load"), None);
    }

    #[test]
    fn test_client_encode_shapes() {
        assert_eq!(ClientMessage::Load.encode().unwrap(), r#"{"type":"load"}"#);
        assert_eq!(
            ClientMessage::LoadSettings.encode().unwrap(),
            r#"{"type":"loadSettings"}"#
        );

        let save = ClientMessage::Save(Payload::Sealed("xyz".into()));
        assert_eq!(save.encode().unwrap(), r#"{"type":"save","data":"xyz"}"#);
    }

    #[test]
    fn test_server_message_wire_shape() {
        let mut rec = AttendanceRecord::new("E1", "Alice");
        rec.attending = true;
        rec.checked_at = Some("2024-01-01T09:05:00Z".into());
        let msg = ServerMessage::Attendees(Payload::Plain(vec![rec]));

        let encoded = msg.encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"type":"attendees","data":[{"employeeId":"E1","name":"Alice","attending":true,"checkedAt":"2024-01-01T09:05:00Z"}]}"#
        );
        assert_eq!(ServerMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_server_message_sealed_settings() {
        let raw = r#"{"type":"publicSettings","data":"c2VhbGVk"}"#;
        let msg = ServerMessage::decode(raw).unwrap();
        assert_eq!(msg.response_type(), ResponseType::PublicSettings);
        assert_eq!(msg, ServerMessage::PublicSettings(Payload::Sealed("c2VhbGVk".into())));
    }

    #[test]
    fn test_parse_frame_size_gate() {
        let at_limit = format!("\"{}\"", "a".repeat(MAX_MESSAGE_BYTES - 2));
        assert!(parse_frame(at_limit.as_bytes(), MAX_MESSAGE_BYTES).is_ok());

        let over = "a".repeat(MAX_MESSAGE_BYTES + 1);
        let err = parse_frame(over.as_bytes(), MAX_MESSAGE_BYTES).unwrap_err();
        assert_eq!(err, ProtocolError::TooLarge { size: 100_001, limit: MAX_MESSAGE_BYTES });
        assert_eq!(err.close_reason().code(), 1009);
    }

    #[test]
    fn test_parse_frame_malformed() {
        let err = parse_frame(b"{not json", MAX_MESSAGE_BYTES).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(err.close_reason(), CloseReason::ServerError);

        let err = parse_frame(&[0x22, 0xFF, 0x22], MAX_MESSAGE_BYTES).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::RateLimited.code(), 1008);
        assert_eq!(CloseReason::TooLarge.code(), 1009);
        assert_eq!(CloseReason::ServerError.code(), 1011);
        assert_eq!(CloseReason::TooLarge.reason(), "Message too large");
    }
}
