//! Application-facing publish API.

use saga_store::{MessageEnvelope, OutboxEntryId, OutboxStore, Transaction};

use crate::error::Result;
use crate::message::{Envelope, Message};

/// Publishes messages by recording them in the outbox.
///
/// Nothing here talks to a transport. With a transaction attached through
/// [`MessageBus::set_transaction`], every publish joins that unit of work and
/// becomes visible only when it commits; without one, each publish commits on
/// its own. Delivery happens later through the outbox dispatcher.
pub struct MessageBus<O: OutboxStore> {
    outbox: O,
    transaction: Option<O::Transaction>,
}

impl<O: OutboxStore> MessageBus<O> {
    pub fn new(outbox: O) -> Self {
        Self {
            outbox,
            transaction: None,
        }
    }

    /// Attaches the transaction used by later publishes, returning the one
    /// previously attached, if any.
    pub fn set_transaction(&mut self, transaction: O::Transaction) -> Option<O::Transaction> {
        self.transaction.replace(transaction)
    }

    /// Detaches the current transaction without committing it.
    pub fn take_transaction(&mut self) -> Option<O::Transaction> {
        self.transaction.take()
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Records a typed message in the outbox.
    pub async fn publish<M: Message>(&mut self, message: &Envelope<M>) -> Result<OutboxEntryId> {
        self.publish_raw(message.to_raw()?).await
    }

    /// Records an already encoded message in the outbox.
    #[tracing::instrument(skip(self, message), fields(message_type = %message.message_type))]
    pub async fn publish_raw(&mut self, message: MessageEnvelope) -> Result<OutboxEntryId> {
        let id = self
            .outbox
            .append(message, self.transaction.as_mut())
            .await?;
        tracing::debug!(entry_id = %id, transactional = self.transaction.is_some(), "message recorded in outbox");
        Ok(id)
    }

    /// Commits the attached transaction, if any.
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction.commit().await?;
        }
        Ok(())
    }

    /// Rolls back the attached transaction, if any.
    pub async fn rollback(&mut self) -> Result<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_store::{CorrelationId, InMemoryStore, Transactional};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct InvoiceIssued {
        number: u32,
    }

    impl Message for InvoiceIssued {
        const MESSAGE_TYPE: &'static str = "InvoiceIssued";
    }

    fn invoice(number: u32) -> Envelope<InvoiceIssued> {
        Envelope::new(CorrelationId::new(), InvoiceIssued { number })
    }

    #[tokio::test]
    async fn publish_without_transaction_is_visible_immediately() {
        let store = InMemoryStore::new();
        let mut bus = MessageBus::new(store.clone());

        bus.publish(&invoice(1)).await.unwrap();

        assert_eq!(store.unsent_count().await, 1);
    }

    #[tokio::test]
    async fn publish_in_transaction_waits_for_commit() {
        let store = InMemoryStore::new();
        let mut bus = MessageBus::new(store.clone());
        bus.set_transaction(store.begin().await.unwrap());

        bus.publish(&invoice(1)).await.unwrap();
        bus.publish(&invoice(2)).await.unwrap();
        assert_eq!(store.unsent_count().await, 0);

        bus.commit().await.unwrap();
        assert!(!bus.has_transaction());

        let entries = store.outbox_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.message_type, "InvoiceIssued");
        assert_eq!(entries[1].message.payload["number"], 2);
    }

    #[tokio::test]
    async fn rollback_discards_published_messages() {
        let store = InMemoryStore::new();
        let mut bus = MessageBus::new(store.clone());
        bus.set_transaction(store.begin().await.unwrap());

        bus.publish(&invoice(1)).await.unwrap();
        bus.rollback().await.unwrap();

        assert!(store.outbox_entries().await.is_empty());
    }

    #[tokio::test]
    async fn taken_transaction_is_detached() {
        let store = InMemoryStore::new();
        let mut bus = MessageBus::new(store.clone());
        bus.set_transaction(store.begin().await.unwrap());

        bus.publish(&invoice(1)).await.unwrap();
        let transaction = bus.take_transaction().unwrap();
        bus.publish(&invoice(2)).await.unwrap();
        assert_eq!(store.unsent_count().await, 1);

        transaction.commit().await.unwrap();
        assert_eq!(store.unsent_count().await, 2);
    }
}
