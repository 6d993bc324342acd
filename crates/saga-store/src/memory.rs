use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;

use crate::{
    CorrelationId, LockId, LockToken, MessageEnvelope, OutboxEntry, OutboxEntryId, OutboxStore,
    Result, SagaRecord, SagaStore, StoreError, Transaction, Transactional, Version,
};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

type SagaKey = (String, CorrelationId);

#[derive(Debug)]
struct Lease {
    lock_id: LockId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SagaSlot {
    record: Option<SagaRecord>,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct Inner {
    sagas: HashMap<SagaKey, SagaSlot>,
    /// Insertion order doubles as creation order.
    outbox: Vec<OutboxEntry>,
}

impl Inner {
    fn check_token(&self, token: &LockToken) -> Result<()> {
        let slot = self
            .sagas
            .get(&(token.saga_type.clone(), token.correlation_id));
        let actual = slot
            .and_then(|s| s.record.as_ref())
            .map(|r| r.version)
            .unwrap_or(Version::initial());
        let holds_lease = slot
            .and_then(|s| s.lease.as_ref())
            .is_some_and(|lease| lease.lock_id == token.lock_id);

        if !holds_lease || actual != token.version {
            return Err(StoreError::StaleToken {
                saga_type: token.saga_type.clone(),
                correlation_id: token.correlation_id,
                expected: token.version,
                actual,
            });
        }
        Ok(())
    }

    fn apply_save(&mut self, mut record: SagaRecord, token: &LockToken) -> Version {
        let version = token.version.next();
        record.saga_type = token.saga_type.clone();
        record.correlation_id = token.correlation_id;
        record.version = version;
        record.updated_at = Utc::now();

        let slot = self
            .sagas
            .entry((token.saga_type.clone(), token.correlation_id))
            .or_default();
        slot.record = Some(record);
        version
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_on_save: AtomicBool,
    fail_on_commit: AtomicBool,
}

/// In-memory saga and outbox store for testing and single-process use.
///
/// Locking is lease based: [`SagaStore::lock`] grants a lease that expires
/// after the configured duration, and [`SagaStore::save`] additionally checks
/// the record version, so a token becomes stale as soon as its lease is taken
/// over or another save lands.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    faults: Arc<Faults>,
    lease_duration: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates a new empty store with a 30 second lease duration.
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            faults: Arc::default(),
            lease_duration: DEFAULT_LEASE,
        }
    }

    /// Sets how long a lease stays valid before another holder may take it over.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Configures saves to fail with a backend error.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.faults.fail_on_save.store(fail, Ordering::SeqCst);
    }

    /// Configures transaction commits to fail with a backend error.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.faults.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Returns every outbox entry, sent or not, in creation order.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.inner.read().await.outbox.clone()
    }

    /// Returns the number of unsent outbox entries.
    pub async fn unsent_count(&self) -> usize {
        self.inner
            .read()
            .await
            .outbox
            .iter()
            .filter(|e| !e.is_sent())
            .count()
    }

    /// Returns true if a live lease is held on the saga instance.
    pub async fn is_locked(&self, saga_type: &str, correlation_id: CorrelationId) -> bool {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .sagas
            .get(&(saga_type.to_string(), correlation_id))
            .and_then(|slot| slot.lease.as_ref())
            .is_some_and(|lease| lease.expires_at > now)
    }

    /// Clears all sagas and outbox entries.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.sagas.clear();
        inner.outbox.clear();
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.lease_duration)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn check_save_fault(&self) -> Result<()> {
        if self.faults.fail_on_save.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("saga save failed".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum StagedWrite {
    Saga { record: SagaRecord, token: LockToken },
    Outbox(OutboxEntry),
}

/// Transaction handle of [`InMemoryStore`].
///
/// Writes are staged locally and applied under a single write lock on commit.
pub struct InMemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    faults: Arc<Faults>,
    staged: Vec<StagedWrite>,
}

impl InMemoryTransaction {
    /// Returns the number of writes staged so far.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(self) -> Result<()> {
        let mut inner = self.inner.write().await;

        if self.faults.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("transaction commit failed".to_string()));
        }

        // Validate every save before applying anything.
        for write in &self.staged {
            if let StagedWrite::Saga { token, .. } = write {
                inner.check_token(token)?;
            }
        }

        for write in self.staged {
            match write {
                StagedWrite::Saga { record, token } => {
                    inner.apply_save(record, &token);
                }
                StagedWrite::Outbox(entry) => inner.outbox.push(entry),
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        tracing::debug!(discarded = self.staged.len(), "transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl Transactional for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            faults: Arc::clone(&self.faults),
            staged: Vec::new(),
        })
    }
}

#[async_trait]
impl SagaStore for InMemoryStore {
    async fn lock(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<(Option<SagaRecord>, LockToken)> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let slot = inner
            .sagas
            .entry((saga_type.to_string(), correlation_id))
            .or_default();

        if let Some(lease) = &slot.lease {
            if lease.expires_at > now {
                return Err(StoreError::Locked {
                    saga_type: saga_type.to_string(),
                    correlation_id,
                });
            }
            tracing::debug!(%saga_type, %correlation_id, "taking over expired lease");
        }

        let lock_id = LockId::new();
        let expires_at = self.lease_expiry(now);
        slot.lease = Some(Lease {
            lock_id,
            expires_at,
        });

        let record = slot.record.clone();
        let token = LockToken {
            saga_type: saga_type.to_string(),
            correlation_id,
            lock_id,
            version: record
                .as_ref()
                .map(|r| r.version)
                .unwrap_or(Version::initial()),
            expires_at,
        };
        Ok((record, token))
    }

    async fn save(
        &self,
        record: SagaRecord,
        token: &LockToken,
        transaction: Option<&mut InMemoryTransaction>,
    ) -> Result<Version> {
        self.check_save_fault()?;

        match transaction {
            Some(tx) => {
                // Fail fast; the check is repeated on commit.
                self.inner.read().await.check_token(token)?;
                tx.staged.push(StagedWrite::Saga {
                    record,
                    token: token.clone(),
                });
                Ok(token.version.next())
            }
            None => {
                let mut inner = self.inner.write().await;
                inner.check_token(token)?;
                Ok(inner.apply_save(record, token))
            }
        }
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (token.saga_type, token.correlation_id);

        let Some(slot) = inner.sagas.get_mut(&key) else {
            return Ok(());
        };
        if slot
            .lease
            .as_ref()
            .is_some_and(|lease| lease.lock_id == token.lock_id)
        {
            slot.lease = None;
        }
        if slot.record.is_none() && slot.lease.is_none() {
            inner.sagas.remove(&key);
        }
        Ok(())
    }

    async fn load(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sagas
            .get(&(saga_type.to_string(), correlation_id))
            .and_then(|slot| slot.record.clone()))
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn append(
        &self,
        message: MessageEnvelope,
        transaction: Option<&mut InMemoryTransaction>,
    ) -> Result<OutboxEntryId> {
        let entry = OutboxEntry::new(message);
        let id = entry.id;

        match transaction {
            Some(tx) => tx.staged.push(StagedWrite::Outbox(entry)),
            None => self.inner.write().await.outbox.push(entry),
        }
        Ok(id)
    }

    async fn list_unsent(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|e| !e.is_sent())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: OutboxEntryId, sent_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::OutboxEntryNotFound(id))?;
        entry.sent_at = Some(sent_at);
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.outbox.len();
        inner
            .outbox
            .retain(|e| e.sent_at.is_none_or(|sent_at| sent_at >= cutoff));
        Ok(before - inner.outbox.len())
    }
}
