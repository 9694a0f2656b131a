use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, RedisResult};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared Redis connection manager guarded by a Tokio mutex.
type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Redis handle shared by the key store, message cache and relay publisher.
///
/// Pub/sub needs a dedicated connection, so the raw client is kept alongside
/// the multiplexed manager.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("failed to parse REDIS_URL connection string")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to initialize Redis connection manager")?;
        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub async fn connection(&self) -> ConnectionManager {
        let guard = self.manager.lock().await;
        guard.clone()
    }

    pub async fn pubsub(&self) -> RedisResult<PubSub> {
        self.client.get_async_pubsub().await
    }
}
