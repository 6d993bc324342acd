use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{MessageEnvelope, Result, Transactional};

/// Durable identifier of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEntryId(Uuid);

impl OutboxEntryId {
    /// Creates a new random outbox entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an outbox entry ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OutboxEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message waiting in (or already drained from) the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    pub message: MessageEnvelope,
    pub created_at: DateTime<Utc>,
    /// Set once the transport acknowledged the message.
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Creates an unsent entry for a message.
    pub fn new(message: MessageEnvelope) -> Self {
        Self {
            id: OutboxEntryId::new(),
            message,
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    /// Returns true once the entry has been dispatched.
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }
}

/// Storage contract for the transactional outbox.
#[async_trait]
pub trait OutboxStore: Transactional {
    /// Records a message as an unsent outbox entry.
    ///
    /// With a transaction the entry becomes visible only when it commits;
    /// without one it is committed immediately.
    async fn append(
        &self,
        message: MessageEnvelope,
        transaction: Option<&mut Self::Transaction>,
    ) -> Result<OutboxEntryId>;

    /// Returns up to `limit` unsent entries, oldest first.
    async fn list_unsent(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Marks an entry as sent.
    async fn mark_sent(&self, id: OutboxEntryId, sent_at: DateTime<Utc>) -> Result<()>;

    /// Deletes sent entries whose `sent_at` is older than `cutoff`.
    ///
    /// Unsent entries are never deleted. Returns the number of entries removed.
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
