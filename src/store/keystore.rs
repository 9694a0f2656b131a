use super::{Expiry, KeyValueStore, StoreError};
use crate::crypto::KeyMaterial;
use crate::models::UserId;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

fn enc_key(user_id: UserId) -> String {
    format!("enc:{}", user_id)
}

fn mac_key(user_id: UserId) -> String {
    format!("mac:{}", user_id)
}

/// Per-user key material in the shared key-value store.
///
/// Keys are namespaced by role (`enc:<uid>`, `mac:<uid>`) and always written
/// with the configured TTL.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Writes both halves together, replacing any earlier material.
    pub async fn publish(&self, user_id: UserId, keys: &KeyMaterial) -> Result<(), StoreError> {
        let enc = enc_key(user_id);
        let mac = mac_key(user_id);
        self.backend
            .put_many(
                &[
                    (enc.as_str(), keys.enc_key().as_slice()),
                    (mac.as_str(), keys.mac_key().as_slice()),
                ],
                Expiry::After(self.ttl),
            )
            .await
    }

    /// Returns `None` unless both halves are present and well formed.
    pub async fn lookup(&self, user_id: UserId) -> Result<Option<KeyMaterial>, StoreError> {
        let enc = self.backend.get(&enc_key(user_id)).await?;
        let mac = self.backend.get(&mac_key(user_id)).await?;

        let (Some(enc), Some(mac)) = (enc, mac) else {
            return Ok(None);
        };

        match KeyMaterial::from_slices(&enc, &mac) {
            Ok(keys) => Ok(Some(keys)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Ignoring malformed key material");
                Ok(None)
            }
        }
    }
}
