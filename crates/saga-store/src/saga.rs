use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorrelationId, Result, Transactional, Version};

/// Persisted form of a saga's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga type this state belongs to (e.g., "OrderSaga").
    pub saga_type: String,

    /// The saga instance.
    pub correlation_id: CorrelationId,

    /// Version of the record, bumped by every save.
    pub version: Version,

    /// The serialized saga state.
    pub state: serde_json::Value,

    /// When the record was last saved.
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a record for a saga that has not been saved yet.
    pub fn new(
        saga_type: impl Into<String>,
        correlation_id: CorrelationId,
        state: serde_json::Value,
    ) -> Self {
        Self {
            saga_type: saga_type.into(),
            correlation_id,
            version: Version::initial(),
            state,
            updated_at: Utc::now(),
        }
    }
}

/// Identifier of a single lease granted on a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(Uuid);

impl LockId {
    /// Creates a new random lock ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of exclusive access to a saga instance.
///
/// Returned by [`SagaStore::lock`] and required by [`SagaStore::save`]. A save
/// is only accepted while the token's lease is still the current one and the
/// stored version still equals `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub lock_id: LockId,
    /// Version of the record when the lock was taken.
    pub version: Version,
    pub expires_at: DateTime<Utc>,
}

/// Storage contract for saga state.
///
/// Implementations decide how exclusivity is enforced (lease rows,
/// compare-and-swap on version, or both), but must guarantee that at most
/// one holder gets a successful `save` for a given saga instance at a time.
#[async_trait]
pub trait SagaStore: Transactional {
    /// Loads the record for a saga instance and takes an exclusive lease on it.
    ///
    /// Returns `None` as the record when the saga was never saved; the lease is
    /// still taken so concurrent creators conflict. Fails with
    /// [`crate::StoreError::Locked`] if another holder owns a live lease.
    async fn lock(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<(Option<SagaRecord>, LockToken)>;

    /// Persists a record if `token` is still valid.
    ///
    /// With a transaction the write becomes visible only when it commits;
    /// without one it is applied immediately. Returns the new version.
    async fn save(
        &self,
        record: SagaRecord,
        token: &LockToken,
        transaction: Option<&mut Self::Transaction>,
    ) -> Result<Version>;

    /// Releases the lease held by `token`.
    ///
    /// Best effort: releasing a lease that was already taken over is not an error.
    async fn release(&self, token: LockToken) -> Result<()>;

    /// Loads the committed record without taking a lease.
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>>;
}
