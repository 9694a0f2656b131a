use crate::crypto::SealedPayload;
use crate::models::{MessageId, SessionId, UserId};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body carried on the relay.
///
/// `Plaintext` is the low-latency default; `Sealed` forwards the stored
/// ciphertext and every receiving process decrypts with the sender's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Plaintext {
        text: String,
    },
    Sealed {
        /// Base64 ciphertext
        ciphertext: String,
        /// Base64 12-byte nonce
        nonce: String,
        /// Base64 16-byte GCM tag
        tag: String,
    },
}

impl EnvelopeBody {
    pub fn sealed(payload: &SealedPayload) -> Self {
        EnvelopeBody::Sealed {
            ciphertext: STANDARD.encode(payload.ciphertext()),
            nonce: STANDARD.encode(payload.nonce()),
            tag: STANDARD.encode(payload.tag()),
        }
    }
}

/// Unit of fan-out between processes. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub body: EnvelopeBody,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Record handed to the durable store. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub sealed: SealedPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub sealed: SealedPayload,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_new(id: MessageId, msg: NewMessage) -> Self {
        Self {
            id,
            session_id: msg.session_id,
            sender_id: msg.sender_id,
            sealed: msg.sealed,
            created_at: msg.created_at,
        }
    }
}

/// Cache representation of a [`StoredMessage`] (`message:<id>`).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CachedMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for CachedMessage {
    fn from(msg: &StoredMessage) -> Self {
        Self {
            id: msg.id,
            session_id: msg.session_id,
            sender_id: msg.sender_id,
            ciphertext: STANDARD.encode(msg.sealed.ciphertext()),
            nonce: STANDARD.encode(msg.sealed.nonce()),
            tag: STANDARD.encode(msg.sealed.tag()),
            created_at: msg.created_at,
        }
    }
}

impl CachedMessage {
    pub fn into_stored(self) -> Result<StoredMessage, String> {
        let sealed = decode_sealed(&self.ciphertext, &self.nonce, &self.tag)?;
        Ok(StoredMessage {
            id: self.id,
            session_id: self.session_id,
            sender_id: self.sender_id,
            sealed,
            created_at: self.created_at,
        })
    }
}

/// Decodes base64 parts into a [`SealedPayload`], validating nonce and tag lengths.
pub fn decode_sealed(ciphertext: &str, nonce: &str, tag: &str) -> Result<SealedPayload, String> {
    let ciphertext = STANDARD
        .decode(ciphertext)
        .map_err(|e| format!("ciphertext: {e}"))?;
    let nonce = STANDARD.decode(nonce).map_err(|e| format!("nonce: {e}"))?;
    let tag = STANDARD.decode(tag).map_err(|e| format!("tag: {e}"))?;
    SealedPayload::from_parts(ciphertext, &nonce, &tag).map_err(|e| e.to_string())
}
