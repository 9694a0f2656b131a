// Shared fixtures for the integration tests.
//
// A `Cluster` stands in for a deployment: every node shares one in-process
// relay bus, one key-value store and one message store, the way several
// service processes share Redis and Postgres.

#![allow(dead_code)]

pub mod fake_redis;

use session_chat_service::config::{Config, FanoutMode};
use session_chat_service::crypto::handshake::derive_keys;
use session_chat_service::crypto::{HandshakeService, KeyMaterial, ServerIdentity};
use session_chat_service::models::{SessionId, UserId};
use session_chat_service::redis_client::RedisClient;
use session_chat_service::relay::{
    ChannelNames, LocalBus, LocalRelay, PendingReader, PubSubRelay, RedisRelay, RelayReaderHandle,
};
use session_chat_service::services::MessageGateway;
use session_chat_service::state::AppState;
use session_chat_service::store::{KeyStore, MemoryKeyValueStore, MemoryMessageStore, MessageCache};
use session_chat_service::websocket::{ConnectionHandle, ConnectionId, SessionConnectionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_TTL: Duration = Duration::from_secs(3600);
const CACHE_TTL: Duration = Duration::from_secs(600);

pub struct Cluster {
    pub bus: LocalBus,
    pub kv: Arc<MemoryKeyValueStore>,
    pub messages: Arc<MemoryMessageStore>,
    pub identity: ServerIdentity,
    pub fanout: FanoutMode,
}

/// One service process attached to the cluster.
pub struct Node {
    pub relay: LocalRelay,
    pub registry: SessionConnectionRegistry,
    pub gateway: Arc<MessageGateway>,
    pub handshake: Arc<HandshakeService>,
    _reader: RelayReaderHandle,
}

/// A service process whose relay talks to a Redis server.
pub struct RedisNode {
    pub relay: RedisRelay,
    pub registry: SessionConnectionRegistry,
    pub gateway: Arc<MessageGateway>,
    pub handshake: Arc<HandshakeService>,
    _reader: RelayReaderHandle,
}

struct Wiring {
    registry: SessionConnectionRegistry,
    gateway: Arc<MessageGateway>,
    handshake: Arc<HandshakeService>,
    reader: RelayReaderHandle,
}

impl Cluster {
    pub fn new(fanout: FanoutMode) -> Self {
        Self {
            bus: LocalBus::new(),
            kv: Arc::new(MemoryKeyValueStore::new()),
            messages: Arc::new(MemoryMessageStore::new()),
            identity: ServerIdentity::generate(),
            fanout,
        }
    }

    pub async fn node(&self) -> Node {
        let (relay, reader) = self.bus.attach().await;
        let wiring = self.wire(Arc::new(relay.clone()), PendingReader::Local(reader));

        Node {
            relay,
            registry: wiring.registry,
            gateway: wiring.gateway,
            handshake: wiring.handshake,
            _reader: wiring.reader,
        }
    }

    /// A node whose relay publishes and subscribes through the Redis at `url`.
    pub async fn redis_node(&self, url: &str) -> RedisNode {
        let redis = RedisClient::connect(url).await.expect("redis reachable");
        let (relay, reader) = RedisRelay::new(redis, ChannelNames::new("session"));
        let wiring = self.wire(Arc::new(relay.clone()), PendingReader::Redis(reader));

        RedisNode {
            relay,
            registry: wiring.registry,
            gateway: wiring.gateway,
            handshake: wiring.handshake,
            _reader: wiring.reader,
        }
    }

    fn wire(&self, relay: Arc<dyn PubSubRelay>, reader: PendingReader) -> Wiring {
        let keys = KeyStore::new(self.kv.clone(), KEY_TTL);
        let cache = MessageCache::new(self.kv.clone(), CACHE_TTL);
        let registry = SessionConnectionRegistry::new(relay.clone());
        let gateway = Arc::new(MessageGateway::new(
            keys.clone(),
            self.messages.clone(),
            cache,
            relay,
            registry.clone(),
            self.fanout,
        ));
        let reader = reader.spawn(gateway.clone());
        let handshake = Arc::new(HandshakeService::new(self.identity.clone(), keys));

        Wiring {
            registry,
            gateway,
            handshake,
            reader,
        }
    }
}

impl Node {
    /// Joins `session_id` as `user_id` and returns the connection's frame stream.
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> (ConnectionId, UnboundedReceiver<String>) {
        join(&self.registry, session_id, user_id).await
    }

    pub fn app_state(&self, fanout: FanoutMode) -> AppState {
        let config = Config::from_lookup(|key| match key {
            "FANOUT_MODE" => Some(fanout.as_str().to_string()),
            _ => None,
        })
        .expect("default config");

        AppState {
            config: Arc::new(config),
            registry: self.registry.clone(),
            gateway: self.gateway.clone(),
            handshake: self.handshake.clone(),
        }
    }
}

impl RedisNode {
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> (ConnectionId, UnboundedReceiver<String>) {
        join(&self.registry, session_id, user_id).await
    }
}

pub async fn join(
    registry: &SessionConnectionRegistry,
    session_id: SessionId,
    user_id: UserId,
) -> (ConnectionId, UnboundedReceiver<String>) {
    let (handle, rx) = ConnectionHandle::new(user_id);
    let id = handle.id();
    registry
        .add(session_id, handle)
        .await
        .expect("join should succeed");
    (id, rx)
}

/// Client side of the key exchange. Returns the keys the client derives,
/// which must match what the server published.
pub async fn client_handshake(node: &Node, user_id: UserId, seed: u8) -> KeyMaterial {
    handshake_with(&node.handshake, user_id, seed).await
}

pub async fn handshake_with(service: &HandshakeService, user_id: UserId, seed: u8) -> KeyMaterial {
    let secret = StaticSecret::from([seed; 32]);
    let public = PublicKey::from(&secret);

    let outcome = service
        .perform(user_id, public.as_bytes())
        .await
        .expect("handshake should succeed");

    let shared = secret.diffie_hellman(&PublicKey::from(outcome.server_public_key));
    derive_keys(shared.as_bytes(), &outcome.salt).expect("derive client keys")
}

pub async fn recv_frame(rx: &mut UnboundedReceiver<String>) -> Option<serde_json::Value> {
    let frame = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()??;
    Some(serde_json::from_str(&frame).expect("frames are JSON"))
}

/// Asserts nothing arrives within a short window.
pub async fn assert_silent(rx: &mut UnboundedReceiver<String>) {
    let frame = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(frame.is_err(), "unexpected frame: {:?}", frame);
}
