use super::{ChannelNames, DeliveryHandler, PubSubRelay, RelayError, RelayReaderHandle};
use crate::metrics;
use crate::models::SessionId;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::{Stream, StreamExt};
use redis::{AsyncCommands, Msg, RedisResult};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

/// Topic set shared between the relay handle and its reader.
#[derive(Default)]
struct Subscriptions {
    topics: DashSet<SessionId>,
    connected: AtomicBool,
    stopped: AtomicBool,
}

/// Marks the reader as stopped however its task ends, abort included.
struct StoppedOnDrop(Arc<Subscriptions>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0.connected.store(false, Ordering::Release);
        self.0.stopped.store(true, Ordering::Release);
    }
}

/// Redis pub/sub relay.
///
/// Publishing goes through the shared connection manager. The reader holds a
/// single pattern subscription on `<prefix>:*` and drops deliveries for
/// topics this process has not subscribed to, so subscribe and unsubscribe
/// only touch the local topic set and never wait on the pub/sub connection.
#[derive(Clone)]
pub struct RedisRelay {
    redis: RedisClient,
    names: ChannelNames,
    subscriptions: Arc<Subscriptions>,
}

impl RedisRelay {
    pub fn new(redis: RedisClient, names: ChannelNames) -> (Self, RelayReader) {
        let subscriptions = Arc::new(Subscriptions::default());
        let relay = Self {
            redis: redis.clone(),
            names: names.clone(),
            subscriptions: subscriptions.clone(),
        };
        let reader = RelayReader {
            redis,
            names,
            subscriptions,
        };
        (relay, reader)
    }

    /// True while the reader holds a confirmed pattern subscription.
    pub fn is_connected(&self) -> bool {
        self.subscriptions.connected.load(Ordering::Acquire)
    }

    pub fn is_subscribed(&self, topic: SessionId) -> bool {
        self.subscriptions.topics.contains(&topic)
    }

    fn ensure_running(&self) -> Result<(), RelayError> {
        if self.subscriptions.stopped.load(Ordering::Acquire) {
            return Err(RelayError::ReaderStopped);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubRelay for RedisRelay {
    async fn publish(&self, topic: SessionId, payload: String) -> Result<(), RelayError> {
        let mut conn = self.redis.connection().await;
        let receivers: i64 = conn.publish(self.names.channel(topic), payload).await?;
        debug!(session_id = %topic, receivers, "Published to relay");
        Ok(())
    }

    async fn subscribe(&self, topic: SessionId) -> Result<(), RelayError> {
        self.ensure_running()?;
        self.subscriptions.topics.insert(topic);
        debug!(
            session_id = %topic,
            active = self.subscriptions.topics.len(),
            "Relay topic subscribed"
        );
        Ok(())
    }

    async fn unsubscribe(&self, topic: SessionId) -> Result<(), RelayError> {
        self.subscriptions.topics.remove(&topic);
        debug!(
            session_id = %topic,
            active = self.subscriptions.topics.len(),
            "Relay topic unsubscribed"
        );
        self.ensure_running()
    }
}

enum ReaderExit {
    Disconnected,
    Shutdown,
}

/// Background task draining the pub/sub connection for the process lifetime.
///
/// Malformed deliveries are logged and skipped. A lost connection is
/// re-established with backoff and the pattern subscribed again; the topic
/// set survives reconnects untouched.
pub struct RelayReader {
    redis: RedisClient,
    names: ChannelNames,
    subscriptions: Arc<Subscriptions>,
}

impl RelayReader {
    pub fn spawn(self, handler: Arc<dyn DeliveryHandler>) -> RelayReaderHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(self.run(handler, shutdown_rx));
        RelayReaderHandle::new(shutdown_tx, handle)
    }

    async fn run(self, handler: Arc<dyn DeliveryHandler>, mut shutdown: watch::Receiver<()>) {
        let _stopped = StoppedOnDrop(self.subscriptions.clone());
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut messages = match self.connect().await {
                Ok(messages) => {
                    info!(
                        pattern = %self.names.pattern(),
                        topics = self.subscriptions.topics.len(),
                        "Relay reader connected"
                    );
                    backoff = INITIAL_BACKOFF;
                    messages
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?backoff, "Relay reader failed to connect");
                    if wait_offline(backoff, &mut shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            match self.pump(&mut messages, &handler, &mut shutdown).await {
                ReaderExit::Shutdown => break,
                ReaderExit::Disconnected => {
                    self.subscriptions.connected.store(false, Ordering::Release);
                    warn!(retry_in = ?backoff, "Relay pub/sub connection lost");
                    if wait_offline(backoff, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Relay reader shutting down");
    }

    /// Opens the pub/sub connection and subscribes the topic pattern. The
    /// returned stream owns the connection; its frame buffer lives as long as
    /// the connection does.
    async fn connect(&self) -> RedisResult<MessageStream> {
        let mut pubsub = self.redis.pubsub().await?;
        pubsub.psubscribe(self.names.pattern()).await?;
        self.subscriptions.connected.store(true, Ordering::Release);
        Ok(Box::pin(pubsub.into_on_message()))
    }

    async fn pump(
        &self,
        messages: &mut MessageStream,
        handler: &Arc<dyn DeliveryHandler>,
        shutdown: &mut watch::Receiver<()>,
    ) -> ReaderExit {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return ReaderExit::Shutdown,
                msg = messages.next() => match msg {
                    Some(msg) => self.dispatch(msg, handler).await,
                    None => return ReaderExit::Disconnected,
                },
            }
        }
    }

    async fn dispatch(&self, msg: Msg, handler: &Arc<dyn DeliveryHandler>) {
        let channel = msg.get_channel_name();
        let Some(topic) = self.names.topic(channel) else {
            warn!(channel, "Skipping relay message on unrecognised channel");
            metrics::RELAY_MALFORMED_TOTAL.inc();
            return;
        };

        if !self.subscriptions.topics.contains(&topic) {
            trace!(session_id = %topic, "No local members for relay message");
            return;
        }

        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session_id = %topic, error = %e, "Skipping undecodable relay payload");
                metrics::RELAY_MALFORMED_TOTAL.inc();
                return;
            }
        };

        handler.deliver(topic, payload).await;
    }
}

/// Waits out a backoff period. Returns true on shutdown.
async fn wait_offline(delay: Duration, shutdown: &mut watch::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        seen: std::sync::Mutex<Vec<(SessionId, String)>>,
    }

    #[async_trait]
    impl DeliveryHandler for Collect {
        async fn deliver(&self, topic: SessionId, payload: String) {
            self.seen.lock().unwrap().push((topic, payload));
        }
    }

    async fn relay(prefix: &str) -> (RedisRelay, RelayReader) {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let redis = RedisClient::connect(&url).await.expect("redis reachable");
        RedisRelay::new(redis, ChannelNames::new(prefix))
    }

    async fn wait_connected(relay: &RedisRelay) {
        for _ in 0..100 {
            if relay.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("relay reader never connected");
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis
    async fn test_fanout_between_two_processes() {
        let prefix = format!("relay-test-{}", uuid::Uuid::new_v4());
        let (publisher, publisher_reader) = relay(&prefix).await;
        let (subscriber, subscriber_reader) = relay(&prefix).await;

        let seen = Arc::new(Collect::default());
        let _publisher_reader = publisher_reader.spawn(Arc::new(Collect::default()));
        let _subscriber_reader = subscriber_reader.spawn(seen.clone());
        wait_connected(&subscriber).await;

        subscriber.subscribe(SessionId(42)).await.unwrap();
        publisher.publish(SessionId(42), "first".into()).await.unwrap();
        publisher.publish(SessionId(42), "second".into()).await.unwrap();
        publisher.publish(SessionId(7), "elsewhere".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *seen.seen.lock().unwrap(),
            vec![
                (SessionId(42), "first".to_string()),
                (SessionId(42), "second".to_string()),
            ]
        );

        subscriber.unsubscribe(SessionId(42)).await.unwrap();
        publisher.publish(SessionId(42), "late".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_reader_exit_marks_relay_stopped() {
        let subscriptions = Arc::new(Subscriptions::default());
        subscriptions.connected.store(true, Ordering::Release);
        subscriptions.topics.insert(SessionId(3));

        drop(StoppedOnDrop(subscriptions.clone()));

        assert!(subscriptions.stopped.load(Ordering::Acquire));
        assert!(!subscriptions.connected.load(Ordering::Acquire));
        assert!(subscriptions.topics.contains(&SessionId(3)));
    }
}
