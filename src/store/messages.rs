use super::StoreError;
use crate::crypto::SealedPayload;
use crate::models::message::{NewMessage, StoredMessage};
use crate::models::{MessageId, SessionId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_postgres::Pool;
use std::sync::atomic::{AtomicI64, Ordering};

/// Durable message storage. Persisted rows hold ciphertext only.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, message: NewMessage) -> Result<MessageId, StoreError>;

    /// Fails with [`StoreError::NotFound`] for unknown ids.
    async fn get(&self, id: MessageId) -> Result<StoredMessage, StoreError>;
}

#[derive(Clone)]
pub struct PgMessageStore {
    db: Pool,
}

impl PgMessageStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn save(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        let client = self.db.get().await?;

        let row = client
            .query_one(
                r#"
                INSERT INTO session_messages (session_id, sender_id, ciphertext, nonce, tag, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                "#,
                &[
                    &message.session_id.0,
                    &message.sender_id.0,
                    &message.sealed.ciphertext(),
                    &message.sealed.nonce().as_slice(),
                    &message.sealed.tag().as_slice(),
                    &message.created_at,
                ],
            )
            .await?;

        Ok(MessageId(row.get(0)))
    }

    async fn get(&self, id: MessageId) -> Result<StoredMessage, StoreError> {
        let client = self.db.get().await?;

        let row = client
            .query_opt(
                r#"
                SELECT id, session_id, sender_id, ciphertext, nonce, tag, created_at
                FROM session_messages
                WHERE id = $1
                "#,
                &[&id.0],
            )
            .await?
            .ok_or(StoreError::NotFound)?;

        let ciphertext: Vec<u8> = row.get(3);
        let nonce: Vec<u8> = row.get(4);
        let tag: Vec<u8> = row.get(5);
        let sealed = SealedPayload::from_parts(ciphertext, &nonce, &tag).map_err(|e| {
            StoreError::Corrupt {
                key: format!("session_messages:{}", id),
                reason: e.to_string(),
            }
        })?;

        Ok(StoredMessage {
            id: MessageId(row.get(0)),
            session_id: SessionId(row.get(1)),
            sender_id: UserId(row.get(2)),
            sealed,
            created_at: row.get(6),
        })
    }
}

/// In-process store for single-node mode and tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    next_id: AtomicI64,
    messages: DashMap<MessageId, StoredMessage>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.messages.insert(id, StoredMessage::from_new(id, message));
        Ok(id)
    }

    async fn get(&self, id: MessageId) -> Result<StoredMessage, StoreError> {
        self.messages
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound)
    }
}
