use super::{DeliveryHandler, PubSubRelay, RelayError, RelayReaderHandle};
use crate::models::SessionId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

type Delivery = (SessionId, String);

struct Node {
    id: u64,
    topics: HashSet<SessionId>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

/// In-process pub/sub backbone.
///
/// Every [`LocalRelay`] attached to the same bus behaves like a separate
/// process sharing one Redis instance: it only receives topics it has
/// subscribed to, including its own publishes.
#[derive(Clone, Default)]
pub struct LocalBus {
    nodes: Arc<Mutex<Vec<Node>>>,
    next_node: Arc<AtomicU64>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self) -> (LocalRelay, LocalReader) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_node.fetch_add(1, Ordering::Relaxed);
        self.nodes.lock().await.push(Node {
            id,
            topics: HashSet::new(),
            deliveries: tx,
        });

        let relay = LocalRelay {
            bus: self.clone(),
            node: id,
            subscribes: Arc::new(DashMap::new()),
            unsubscribes: Arc::new(DashMap::new()),
        };
        (relay, LocalReader { deliveries: rx })
    }
}

#[derive(Clone)]
pub struct LocalRelay {
    bus: LocalBus,
    node: u64,
    subscribes: Arc<DashMap<SessionId, usize>>,
    unsubscribes: Arc<DashMap<SessionId, usize>>,
}

impl LocalRelay {
    pub async fn is_subscribed(&self, topic: SessionId) -> bool {
        self.bus
            .nodes
            .lock()
            .await
            .iter()
            .any(|node| node.id == self.node && node.topics.contains(&topic))
    }

    /// Number of subscribe calls seen for `topic` by this relay.
    pub fn subscribe_count(&self, topic: SessionId) -> usize {
        self.subscribes.get(&topic).map(|c| *c).unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, topic: SessionId) -> usize {
        self.unsubscribes.get(&topic).map(|c| *c).unwrap_or(0)
    }

    async fn update_topics(&self, f: impl FnOnce(&mut HashSet<SessionId>)) -> Result<(), RelayError> {
        let mut nodes = self.bus.nodes.lock().await;
        let node = nodes
            .iter_mut()
            .find(|node| node.id == self.node)
            .ok_or(RelayError::ReaderStopped)?;
        f(&mut node.topics);
        Ok(())
    }
}

#[async_trait]
impl PubSubRelay for LocalRelay {
    async fn publish(&self, topic: SessionId, payload: String) -> Result<(), RelayError> {
        let mut nodes = self.bus.nodes.lock().await;
        nodes.retain(|node| !node.deliveries.is_closed());

        let mut receivers = 0;
        for node in nodes.iter().filter(|node| node.topics.contains(&topic)) {
            if node.deliveries.send((topic, payload.clone())).is_ok() {
                receivers += 1;
            }
        }
        debug!(session_id = %topic, receivers, "Published to local bus");
        Ok(())
    }

    async fn subscribe(&self, topic: SessionId) -> Result<(), RelayError> {
        self.update_topics(|topics| {
            topics.insert(topic);
        })
        .await?;
        *self.subscribes.entry(topic).or_insert(0) += 1;
        Ok(())
    }

    async fn unsubscribe(&self, topic: SessionId) -> Result<(), RelayError> {
        self.update_topics(|topics| {
            topics.remove(&topic);
        })
        .await?;
        *self.unsubscribes.entry(topic).or_insert(0) += 1;
        Ok(())
    }
}

/// Receiving half of a node on the bus.
pub struct LocalReader {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl LocalReader {
    /// Feeds every delivery to `handler` in arrival order until shut down.
    pub fn spawn(mut self, handler: Arc<dyn DeliveryHandler>) -> RelayReaderHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    delivery = self.deliveries.recv() => match delivery {
                        Some((topic, payload)) => handler.deliver(topic, payload).await,
                        None => break,
                    },
                }
            }
        });
        RelayReaderHandle::new(shutdown_tx, handle)
    }
}
