//! Cross-process fan-out over a publish/subscribe backbone.
//!
//! Topics are session ids. Each process holds at most one subscription per
//! topic; multiplexing onto local connections is the registry's job.

pub mod local;
pub mod redis_relay;

pub use self::local::{LocalBus, LocalReader, LocalRelay};
pub use self::redis_relay::{RedisRelay, RelayReader};

use crate::models::SessionId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("relay reader is not running")]
    ReaderStopped,
}

#[async_trait]
pub trait PubSubRelay: Send + Sync {
    /// Fire-and-forget publish to every subscriber of `topic` in every process.
    async fn publish(&self, topic: SessionId, payload: String) -> Result<(), RelayError>;

    async fn subscribe(&self, topic: SessionId) -> Result<(), RelayError>;

    /// Only called once the process has no local connections left for `topic`.
    async fn unsubscribe(&self, topic: SessionId) -> Result<(), RelayError>;
}

/// Consumer invoked by a relay reader for every delivered message.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, topic: SessionId, payload: String);
}

/// A relay reader built but not yet running. Readers start once the
/// delivery handler exists, which itself depends on the relay.
pub enum PendingReader {
    Redis(RelayReader),
    Local(LocalReader),
}

impl PendingReader {
    pub fn spawn(self, handler: Arc<dyn DeliveryHandler>) -> RelayReaderHandle {
        match self {
            PendingReader::Redis(reader) => reader.spawn(handler),
            PendingReader::Local(reader) => reader.spawn(handler),
        }
    }
}

/// Keeps a reader task alive; dropping it stops the task.
#[must_use = "dropping the handle stops the reader"]
pub struct RelayReaderHandle {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl RelayReaderHandle {
    pub(crate) fn new(shutdown_tx: watch::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            shutdown_tx,
            handle,
        }
    }
}

impl Drop for RelayReaderHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}

/// Channel naming for a topic: `<prefix>:<session_id>`.
#[derive(Debug, Clone)]
pub struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn channel(&self, topic: SessionId) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    /// Pattern matching every topic channel under the prefix.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    pub fn topic(&self, channel: &str) -> Option<SessionId> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .parse()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_roundtrip() {
        let names = ChannelNames::new("session");
        assert_eq!(names.channel(SessionId(42)), "session:42");
        assert_eq!(names.topic("session:42"), Some(SessionId(42)));
        assert_eq!(names.pattern(), "session:*");
    }

    #[test]
    fn test_channel_names_reject_foreign_channels() {
        let names = ChannelNames::new("session");
        assert_eq!(names.topic("conversation:42"), None);
        assert_eq!(names.topic("session42"), None);
        assert_eq!(names.topic("session:abc"), None);
        assert_eq!(names.topic("sessions:1"), None);
    }
}
