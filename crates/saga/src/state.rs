//! Saga state with idempotency bookkeeping and an outbound buffer.

use std::collections::HashSet;

use saga_store::{CorrelationId, MessageEnvelope, MessageId, OutboxStore};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::message::{Correlated, Envelope, Message};

/// The state of one saga instance.
///
/// `data` is the saga's own business state. Around it the runtime keeps the
/// completion flag, the IDs of every message already applied, and a transient
/// buffer of outbound messages produced by the current processing step. The
/// buffer is never serialized; it only lives until it is flushed into the
/// outbox together with the state save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState<D> {
    id: CorrelationId,
    is_completed: bool,
    processed_message_ids: HashSet<MessageId>,
    data: D,
    #[serde(skip)]
    outbox: Vec<MessageEnvelope>,
}

impl<D> SagaState<D> {
    /// Creates a fresh state for a new saga instance.
    pub fn new(id: CorrelationId, data: D) -> Self {
        Self {
            id,
            is_completed: false,
            processed_message_ids: HashSet::new(),
            data,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    pub fn processed_message_ids(&self) -> &HashSet<MessageId> {
        &self.processed_message_ids
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// Messages buffered by the current step, in the order they were enqueued.
    pub fn outbox(&self) -> &[MessageEnvelope] {
        &self.outbox
    }

    /// Records that `message` has been applied to this state.
    ///
    /// Fails with [`SagaError::InvariantViolation`] if the message is addressed
    /// to a different saga instance.
    pub fn mark_processed(&mut self, message: &impl Correlated) -> Result<()> {
        if message.correlation_id() != self.id {
            return Err(SagaError::InvariantViolation(format!(
                "message {} has correlation id {}, saga state is {}",
                message.message_id(),
                message.correlation_id(),
                self.id
            )));
        }
        self.processed_message_ids.insert(message.message_id());
        Ok(())
    }

    /// Returns true if `message` was already applied.
    pub fn was_processed(&self, message: &impl Correlated) -> bool {
        self.processed_message_ids.contains(&message.message_id())
    }

    /// Marks the saga as finished. Completion is permanent.
    pub fn mark_completed(&mut self) {
        self.is_completed = true;
    }

    /// Buffers an outbound message. No I/O happens until the outbox is flushed.
    pub fn enqueue_outbound<M: Message>(&mut self, message: Envelope<M>) -> Result<()> {
        self.outbox.push(message.to_raw()?);
        Ok(())
    }

    /// Buffers an outbound message that is already in its untyped form.
    pub fn enqueue_outbound_raw(&mut self, message: MessageEnvelope) {
        self.outbox.push(message);
    }

    /// Appends every buffered message to `outbox` within `transaction`, then
    /// clears the buffer.
    ///
    /// The buffer is left untouched if any append fails. Returns the number of
    /// messages written.
    pub async fn flush_outbox_to<O: OutboxStore>(
        &mut self,
        outbox: &O,
        transaction: &mut O::Transaction,
    ) -> Result<usize> {
        for message in &self.outbox {
            outbox.append(message.clone(), Some(&mut *transaction)).await?;
        }
        let written = self.outbox.len();
        self.outbox.clear();
        Ok(written)
    }
}
