use super::{Expiry, KeyValueStore, StoreError};
use crate::models::message::{CachedMessage, StoredMessage};
use crate::models::MessageId;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

fn cache_key(id: MessageId) -> String {
    format!("message:{}", id)
}

/// Short-lived read-through cache of encrypted messages in front of the
/// durable store. Never the source of truth.
#[derive(Clone)]
pub struct MessageCache {
    backend: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl MessageCache {
    pub fn new(backend: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Caches the encrypted copy with an absolute expiry computed now.
    pub async fn put(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let key = cache_key(message.id);
        let value = serde_json::to_vec(&CachedMessage::from(message)).map_err(|e| {
            StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            }
        })?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.backend
            .put(&key, &value, Expiry::At(Utc::now() + ttl))
            .await
    }

    pub async fn get(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
        let key = cache_key(id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };

        let cached: CachedMessage =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        cached
            .into_stored()
            .map(Some)
            .map_err(|reason| StoreError::Corrupt { key, reason })
    }
}
