use thiserror::Error;

use crate::{CorrelationId, OutboxEntryId, Version};

/// Errors that can occur when interacting with a saga or outbox store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another holder currently owns the lease on this saga instance.
    #[error("Saga {saga_type}/{correlation_id} is locked by another holder")]
    Locked {
        saga_type: String,
        correlation_id: CorrelationId,
    },

    /// The lock token no longer matches the stored lease or version.
    #[error(
        "Stale lock token for saga {saga_type}/{correlation_id}: expected version {expected}, found {actual}"
    )]
    StaleToken {
        saga_type: String,
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// The outbox entry does not exist.
    #[error("Outbox entry not found: {0}")]
    OutboxEntryNotFound(OutboxEntryId),

    /// The transaction was already committed or rolled back.
    #[error("Transaction is no longer active")]
    TransactionClosed,

    /// The storage backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if the error means another attempt owns or invalidated the saga lease.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::Locked { .. } | StoreError::StaleToken { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
