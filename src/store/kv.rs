use super::StoreError;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Writes between full sweeps of expired entries in the memory store.
const SWEEP_EVERY: usize = 256;

/// Expiry attached to every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    After(Duration),
    At(DateTime<Utc>),
}

impl Expiry {
    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Expiry::After(ttl) => {
                now + chrono::Duration::from_std(*ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
            }
            Expiry::At(at) => *at,
        }
    }
}

/// Shared get/set store visible to every process instance.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), StoreError>;

    /// Writes several entries with the same expiry. Backends that can do so
    /// apply the writes atomically.
    async fn put_many(&self, entries: &[(&str, &[u8])], expiry: Expiry) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.put(key, value, expiry).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

#[derive(Clone)]
pub struct RedisKeyValueStore {
    redis: RedisClient,
}

impl RedisKeyValueStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn queue_write(pipe: &mut redis::Pipeline, key: &str, value: &[u8], expiry: Expiry) {
        match expiry {
            Expiry::After(ttl) => {
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .ignore();
            }
            Expiry::At(at) => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
                pipe.cmd("EXPIREAT").arg(key).arg(at.timestamp()).ignore();
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn put(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), StoreError> {
        self.put_many(&[(key, value)], expiry).await
    }

    async fn put_many(&self, entries: &[(&str, &[u8])], expiry: Expiry) -> Result<(), StoreError> {
        let mut conn = self.redis.connection().await;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            Self::queue_write(&mut pipe, key, value, expiry);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.redis.connection().await;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }
}

/// Process-local store for single-node mode and tests. Expired entries are
/// dropped on read and swept every [`SWEEP_EVERY`] writes, so keys that are
/// never read again do not accumulate.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, (Vec<u8>, DateTime<Utc>)>,
    writes: AtomicUsize,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().1 > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expiry deadline of a live entry.
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|entry| entry.value().1)
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, deadline)| *deadline > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), StoreError> {
        let deadline = expiry.deadline(Utc::now());
        self.entries
            .insert(key.to_string(), (value.to_vec(), deadline));

        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "Swept expired entries");
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Utc::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.value().1 > now => return Ok(Some(entry.value().0.clone())),
            Some(_) => {}
        }
        self.entries
            .remove_if(key, |_, (_, deadline)| *deadline <= now);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryKeyValueStore::new();
        store
            .put("enc:1", b"secret", Expiry::After(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get("enc:1").await.unwrap(), Some(b"secret".to_vec()));
        assert_eq!(store.get("enc:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_honours_absolute_expiry() {
        let store = MemoryKeyValueStore::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        store.put("message:1", b"x", Expiry::At(past)).await.unwrap();

        assert_eq!(store.get("message:1").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_put_many_writes_every_entry() {
        let store = MemoryKeyValueStore::new();
        store
            .put_many(
                &[("enc:5", b"a".as_slice()), ("mac:5", b"b".as_slice())],
                Expiry::After(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
        let deadline = store.expires_at("mac:5").unwrap();
        assert!(deadline > Utc::now());
    }

    #[tokio::test]
    async fn test_unread_expired_entries_are_swept() {
        let store = MemoryKeyValueStore::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        for i in 0..10_000 {
            store
                .put(&format!("message:{i}"), b"x", Expiry::At(past))
                .await
                .unwrap();
        }

        assert!(
            store.entries.len() < SWEEP_EVERY,
            "expired entries piled up: {}",
            store.entries.len()
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_live_entries() {
        let store = MemoryKeyValueStore::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        store.put("message:1", b"old", Expiry::At(past)).await.unwrap();
        store.put("message:2", b"old", Expiry::At(past)).await.unwrap();
        store
            .put("enc:1", b"live", Expiry::After(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.get("enc:1").await.unwrap(), Some(b"live".to_vec()));
    }
}
