use crate::models::message::{EnvelopeBody, MessageEnvelope};
use crate::models::{MessageId, SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound WebSocket events from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    #[serde(rename = "message")]
    Message { text: String },
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WsOutboundEvent {
    #[serde(rename = "message")]
    Message {
        message_id: MessageId,
        session_id: SessionId,
        sender_id: UserId,
        text: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl WsOutboundEvent {
    /// Client-facing rendering of a plaintext envelope. Sealed envelopes
    /// have to be opened first.
    pub fn from_envelope(envelope: &MessageEnvelope) -> Option<Self> {
        match &envelope.body {
            EnvelopeBody::Plaintext { text } => Some(Self::message(envelope, text.clone())),
            EnvelopeBody::Sealed { .. } => None,
        }
    }

    pub fn message(envelope: &MessageEnvelope, text: String) -> Self {
        WsOutboundEvent::Message {
            message_id: envelope.message_id,
            session_id: envelope.session_id,
            sender_id: envelope.sender_id,
            text,
            timestamp: envelope.timestamp,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        WsOutboundEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"internal","message":"serialization failed"}"#.to_string()
        })
    }
}
