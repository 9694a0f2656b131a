use crate::metrics;
use crate::models::{SessionId, UserId};
use crate::relay::{PubSubRelay, RelayError};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub mod message_types;

/// Unique identifier for one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The registry's view of a live connection: its identity and the channel
/// its socket task drains.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId) -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            sender: tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// True once the socket side has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Default)]
struct SlotState {
    connections: Vec<ConnectionHandle>,
    /// Set once the slot has been removed from the map; later callers
    /// must look the session up again.
    retired: bool,
}

impl SlotState {
    fn live_count(&self) -> usize {
        self.connections.iter().filter(|c| !c.is_closed()).count()
    }
}

#[derive(Default)]
struct SessionSlot {
    state: Mutex<SlotState>,
}

/// Session id → live local connections.
///
/// A session is present only while it has members. The first member
/// subscribes the relay to the session topic and the last one to leave
/// unsubscribes it. Both happen under the session's own lock, so they are
/// serialized per session while other sessions proceed independently.
#[derive(Clone)]
pub struct SessionConnectionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<SessionSlot>>>,
    relay: Arc<dyn PubSubRelay>,
}

impl SessionConnectionRegistry {
    pub fn new(relay: Arc<dyn PubSubRelay>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            relay,
        }
    }

    fn slot(&self, session_id: SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.get(&session_id).map(|e| e.value().clone())
    }

    /// Registers a connection. For the first connection of a session the
    /// relay subscription is established before the connection becomes
    /// visible; if that fails the join is rejected and nothing is kept.
    pub async fn add(
        &self,
        session_id: SessionId,
        connection: ConnectionHandle,
    ) -> Result<(), RelayError> {
        loop {
            let slot = self
                .sessions
                .entry(session_id)
                .or_insert_with(|| Arc::new(SessionSlot::default()))
                .clone();

            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }

            if state.connections.is_empty() {
                if let Err(e) = self.relay.subscribe(session_id).await {
                    tracing::warn!(session_id = %session_id, error = %e, "Relay subscribe failed; rejecting join");
                    self.retire(session_id, &slot, &mut state);
                    return Err(e);
                }
                metrics::ACTIVE_SESSIONS.inc();
                tracing::debug!(session_id = %session_id, "Subscribed relay for session");
            }

            let user_id = connection.user_id();
            state.connections.push(connection);
            metrics::ACTIVE_CONNECTIONS.inc();
            tracing::debug!(
                session_id = %session_id,
                user_id = %user_id,
                members = state.connections.len(),
                "Connection joined session"
            );
            return Ok(());
        }
    }

    /// Deregisters a connection. Unknown sessions or connections are a no-op.
    pub async fn remove(&self, session_id: SessionId, connection_id: ConnectionId) {
        let Some(slot) = self.slot(session_id) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if state.retired {
            return;
        }

        let before = state.connections.len();
        state.connections.retain(|c| c.id != connection_id);
        if state.connections.len() == before {
            return;
        }
        metrics::ACTIVE_CONNECTIONS.dec();
        tracing::debug!(
            session_id = %session_id,
            connection_id = %connection_id,
            remaining = state.connections.len(),
            "Connection left session"
        );

        if state.connections.is_empty() {
            self.release(session_id, &slot, &mut state).await;
        }
    }

    /// Sends `payload` to every local member of the session and returns how
    /// many sends succeeded. A member whose channel is closed is dropped
    /// without affecting the others.
    pub async fn broadcast(&self, session_id: SessionId, payload: &str) -> usize {
        let Some(slot) = self.slot(session_id) else {
            return 0;
        };
        let mut state = slot.state.lock().await;
        if state.retired {
            return 0;
        }

        let before = state.connections.len();
        state
            .connections
            .retain(|c| c.sender.send(payload.to_string()).is_ok());
        let delivered = state.connections.len();

        if delivered != before {
            metrics::ACTIVE_CONNECTIONS.sub((before - delivered) as i64);
            tracing::debug!(
                session_id = %session_id,
                dropped = before - delivered,
                active = delivered,
                "Dropped dead connections during broadcast"
            );
        }
        if state.connections.is_empty() {
            self.release(session_id, &slot, &mut state).await;
        }

        delivered
    }

    pub async fn contains_session(&self, session_id: SessionId) -> bool {
        self.connection_count(session_id).await > 0
    }

    /// Live connections of the session. Members whose socket has already
    /// gone are not counted, even before their deregistration has run.
    pub async fn connection_count(&self, session_id: SessionId) -> usize {
        match self.slot(session_id) {
            Some(slot) => {
                let state = slot.state.lock().await;
                if state.retired {
                    0
                } else {
                    state.live_count()
                }
            }
            None => 0,
        }
    }

    /// Number of sessions with at least one live local connection.
    pub async fn session_count(&self) -> usize {
        let slots: Vec<Arc<SessionSlot>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut count = 0;
        for slot in slots {
            let state = slot.state.lock().await;
            if !state.retired && state.live_count() > 0 {
                count += 1;
            }
        }
        count
    }

    /// Drops every connection and relay subscription. Closing the outbound
    /// channels ends the socket tasks.
    pub async fn shutdown(&self) {
        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (session_id, slot) in slots {
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }
            let closed = state.connections.len();
            state.connections.clear();
            metrics::ACTIVE_CONNECTIONS.sub(closed as i64);

            if closed > 0 {
                self.release(session_id, &slot, &mut state).await;
            } else {
                self.retire(session_id, &slot, &mut state);
            }
        }
        tracing::info!("Session registry shut down");
    }

    async fn release(
        &self,
        session_id: SessionId,
        slot: &Arc<SessionSlot>,
        state: &mut MutexGuard<'_, SlotState>,
    ) {
        if let Err(e) = self.relay.unsubscribe(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Relay unsubscribe failed");
        }
        metrics::ACTIVE_SESSIONS.dec();
        self.retire(session_id, slot, state);
        tracing::debug!(session_id = %session_id, "Session emptied and removed");
    }

    fn retire(
        &self,
        session_id: SessionId,
        slot: &Arc<SessionSlot>,
        state: &mut MutexGuard<'_, SlotState>,
    ) {
        state.retired = true;
        self.sessions
            .remove_if(&session_id, |_, current| Arc::ptr_eq(current, slot));
    }
}
