//! External stores consumed by the core: the shared key-value store (key
//! material and the message cache) and the durable message store.

pub mod cache;
pub mod keystore;
pub mod kv;
pub mod messages;

pub use cache::MessageCache;
pub use keystore::KeyStore;
pub use kv::{Expiry, KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
pub use messages::{MemoryMessageStore, MessageStore, PgMessageStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found")]
    NotFound,

    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Database(e.to_string())
    }
}
