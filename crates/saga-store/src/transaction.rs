use async_trait::async_trait;

use crate::Result;

/// A unit of work spanning saga saves and outbox appends.
///
/// Writes made through a transaction are invisible until [`Transaction::commit`]
/// succeeds, and are discarded as a whole if it fails or on
/// [`Transaction::rollback`]. Dropping a transaction without committing it
/// behaves like a rollback.
#[async_trait]
pub trait Transaction: Send {
    /// Makes every staged write visible atomically.
    async fn commit(self) -> Result<()>;

    /// Discards every staged write.
    async fn rollback(self) -> Result<()>;
}

/// A store able to open transactions.
///
/// [`crate::SagaStore`] and [`crate::OutboxStore`] both build on this trait,
/// so a type implementing both shares one transaction type between them.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// The transaction handle accepted by this store's writes.
    type Transaction: Transaction;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Transaction>;
}
