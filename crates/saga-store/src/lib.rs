//! Persistence contracts for saga state and the transactional outbox.
//!
//! - [`SagaStore`] loads and saves saga records under an exclusive lease
//! - [`OutboxStore`] records outbound messages until they are dispatched
//! - [`Transactional`] opens a [`Transaction`] both stores can write into,
//!   so a saga save and its outbox appends become visible together
//! - [`InMemoryStore`] implements all of the above for tests and single-process use

pub mod error;
pub mod memory;
pub mod message;
pub mod outbox;
pub mod saga;
pub mod transaction;

pub use common::{CorrelationId, MessageId};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use message::{MessageEnvelope, MessageEnvelopeBuilder, Version};
pub use outbox::{OutboxEntry, OutboxEntryId, OutboxStore};
pub use saga::{LockId, LockToken, SagaRecord, SagaStore};
pub use transaction::{Transaction, Transactional};

/// A backend that stores saga state and outbox entries in one durability boundary.
pub trait Persistence: SagaStore + OutboxStore {}

impl<T: SagaStore + OutboxStore> Persistence for T {}
