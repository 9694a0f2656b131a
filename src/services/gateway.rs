use crate::config::FanoutMode;
use crate::crypto::{decrypt, encrypt, CryptoError, KeyMaterial, SealedPayload};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::message::{decode_sealed, EnvelopeBody, MessageEnvelope, NewMessage, StoredMessage};
use crate::models::{MessageId, SessionId, UserId};
use crate::relay::{DeliveryHandler, PubSubRelay};
use crate::store::{KeyStore, MessageCache, MessageStore};
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::SessionConnectionRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A stored message opened with its sender's current key material.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FetchedMessage {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Entry point for client messages and the relay's delivery handler.
///
/// Outbound: encrypt with the sender's keys, persist, cache, publish.
/// Inbound from the relay: render and broadcast to local members only;
/// delivery never touches persistence, so every process can receive the
/// same envelope without duplicating storage.
pub struct MessageGateway {
    keys: KeyStore,
    messages: Arc<dyn MessageStore>,
    cache: MessageCache,
    relay: Arc<dyn PubSubRelay>,
    registry: SessionConnectionRegistry,
    fanout: FanoutMode,
}

impl MessageGateway {
    pub fn new(
        keys: KeyStore,
        messages: Arc<dyn MessageStore>,
        cache: MessageCache,
        relay: Arc<dyn PubSubRelay>,
        registry: SessionConnectionRegistry,
        fanout: FanoutMode,
    ) -> Self {
        Self {
            keys,
            messages,
            cache,
            relay,
            registry,
            fanout,
        }
    }

    pub fn registry(&self) -> &SessionConnectionRegistry {
        &self.registry
    }

    pub async fn receive(
        &self,
        session_id: SessionId,
        sender_id: UserId,
        text: &str,
    ) -> AppResult<MessageEnvelope> {
        let keys = self
            .keys
            .lookup(sender_id)
            .await?
            .ok_or(AppError::UnauthenticatedSender)?;

        let sealed = encrypt(text.as_bytes(), &keys)?;
        let new_message = NewMessage {
            session_id,
            sender_id,
            sealed,
            created_at: Utc::now(),
        };

        let message_id = self
            .messages
            .save(new_message.clone())
            .await
            .map_err(|e| {
                error!(session_id = %session_id, error = %e, "Failed to persist message");
                AppError::StoreUnavailable(e.to_string())
            })?;
        let stored = StoredMessage::from_new(message_id, new_message);

        if let Err(e) = self.cache.put(&stored).await {
            metrics::CACHE_FAILURES_TOTAL.inc();
            let e = AppError::CacheUnavailable(e.to_string());
            warn!(message_id = %message_id, error = %e, "Message cache write failed; continuing");
        }

        let body = match self.fanout {
            FanoutMode::Plaintext => EnvelopeBody::Plaintext {
                text: text.to_string(),
            },
            FanoutMode::Sealed => EnvelopeBody::sealed(&stored.sealed),
        };
        let envelope = MessageEnvelope {
            message_id,
            session_id,
            sender_id,
            body,
            timestamp: stored.created_at,
        };

        let payload = envelope.to_json().map_err(|e| {
            error!(error = %e, "Failed to serialize envelope");
            AppError::Internal
        })?;
        self.relay.publish(session_id, payload).await.map_err(|e| {
            error!(session_id = %session_id, message_id = %message_id, error = %e, "Failed to publish message");
            AppError::from(e)
        })?;

        metrics::MESSAGES_RECEIVED_TOTAL.inc();
        debug!(session_id = %session_id, message_id = %message_id, "Message accepted");
        Ok(envelope)
    }

    /// Read-through lookup: cache first, then the durable store (re-caching
    /// the result).
    pub async fn fetch(&self, message_id: MessageId) -> AppResult<FetchedMessage> {
        let stored = match self.cache.get(message_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => self.load_and_cache(message_id).await?,
            Err(e) => {
                metrics::CACHE_FAILURES_TOTAL.inc();
                warn!(message_id = %message_id, error = %e, "Message cache read failed; using store");
                self.load_and_cache(message_id).await?
            }
        };

        let Some(keys) = self.keys.lookup(stored.sender_id).await? else {
            warn!(
                message_id = %message_id,
                sender_id = %stored.sender_id,
                "Sender key material has expired; message is unreadable"
            );
            return Err(AppError::NotFound);
        };

        let text = match open(&stored.sealed, &keys) {
            Ok(text) => text,
            // The sender has re-handshaked since this message was stored.
            Err(CryptoError::Integrity | CryptoError::Padding) => {
                warn!(
                    message_id = %message_id,
                    sender_id = %stored.sender_id,
                    "Message was sealed under earlier key material; message is unreadable"
                );
                return Err(AppError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FetchedMessage {
            message_id: stored.id,
            session_id: stored.session_id,
            sender_id: stored.sender_id,
            text,
            created_at: stored.created_at,
        })
    }

    async fn load_and_cache(&self, message_id: MessageId) -> AppResult<StoredMessage> {
        let stored = self.messages.get(message_id).await?;
        if let Err(e) = self.cache.put(&stored).await {
            metrics::CACHE_FAILURES_TOTAL.inc();
            warn!(message_id = %message_id, error = %e, "Message cache refill failed");
        }
        Ok(stored)
    }

    async fn render(&self, envelope: &MessageEnvelope) -> Option<WsOutboundEvent> {
        let (ciphertext, nonce, tag) = match &envelope.body {
            EnvelopeBody::Plaintext { .. } => return WsOutboundEvent::from_envelope(envelope),
            EnvelopeBody::Sealed {
                ciphertext,
                nonce,
                tag,
            } => (ciphertext, nonce, tag),
        };

        let sealed = match decode_sealed(ciphertext, nonce, tag) {
            Ok(sealed) => sealed,
            Err(reason) => {
                metrics::INTEGRITY_FAILURES_TOTAL.inc();
                warn!(message_id = %envelope.message_id, %reason, "Dropping sealed envelope with malformed parts");
                return None;
            }
        };

        let keys = match self.keys.lookup(envelope.sender_id).await {
            Ok(Some(keys)) => keys,
            Ok(None) => {
                warn!(message_id = %envelope.message_id, sender_id = %envelope.sender_id, "No key material for sender; dropping envelope");
                return None;
            }
            Err(e) => {
                error!(message_id = %envelope.message_id, error = %e, "Key store lookup failed; dropping envelope");
                return None;
            }
        };

        match open(&sealed, &keys) {
            Ok(text) => Some(WsOutboundEvent::message(envelope, text)),
            Err(e @ (CryptoError::Integrity | CryptoError::Padding)) => {
                metrics::INTEGRITY_FAILURES_TOTAL.inc();
                warn!(message_id = %envelope.message_id, error = %e, "Possible tampering: payload failed verification");
                None
            }
            Err(e) => {
                error!(message_id = %envelope.message_id, error = %e, "Failed to open sealed envelope");
                None
            }
        }
    }
}

/// Decrypts a sealed text payload. Plaintext that is not UTF-8 never came
/// from `receive` and counts as an integrity failure.
fn open(sealed: &SealedPayload, keys: &KeyMaterial) -> Result<String, CryptoError> {
    let plaintext = decrypt(sealed, keys)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Integrity)
}

#[async_trait]
impl DeliveryHandler for MessageGateway {
    async fn deliver(&self, topic: SessionId, payload: String) {
        let envelope = match MessageEnvelope::from_json(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::RELAY_MALFORMED_TOTAL.inc();
                warn!(session_id = %topic, error = %e, "Dropping malformed envelope");
                return;
            }
        };
        if envelope.session_id != topic {
            metrics::RELAY_MALFORMED_TOTAL.inc();
            warn!(
                session_id = %topic,
                envelope_session = %envelope.session_id,
                "Dropping envelope published on the wrong topic"
            );
            return;
        }

        let Some(event) = self.render(&envelope).await else {
            return;
        };

        let delivered = self.registry.broadcast(topic, &event.to_json()).await;
        metrics::RELAY_DELIVERIES_TOTAL.inc_by(delivered as u64);
        debug!(session_id = %topic, message_id = %envelope.message_id, delivered, "Envelope fanned out");
    }
}
