//! Broker-facing consume contract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::TransportMessage;

/// Broker-assigned identifier of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer, to be settled exactly once through
/// [`Consumer::ack`], [`Consumer::requeue`] or [`Consumer::dead_letter`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: DeliveryId,
    pub message: TransportMessage,
    /// How many times this message has been delivered, starting at 1.
    pub attempt: u32,
}

/// Consume side of a broker for one topic or queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Waits up to `timeout` for the next delivery.
    ///
    /// `Ok(None)` means nothing arrived in time. Must never block longer than
    /// `timeout`.
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Removes the message from the queue.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Puts the message back so it is delivered again after `delay`.
    async fn requeue(&self, delivery: Delivery, delay: Duration) -> Result<()>;

    /// Moves the message to the dead-letter path.
    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<()>;
}
