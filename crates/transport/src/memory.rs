use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use saga::{MessagePublisher, SagaError};
use saga_store::MessageEnvelope;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::consumer::{Consumer, Delivery, DeliveryId};
use crate::error::{Result, TransportError};
use crate::message::TransportMessage;

/// A message parked on the dead-letter path.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: TransportMessage,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug)]
struct Pending {
    message: TransportMessage,
    /// Deliveries made so far.
    attempts: u32,
    available_at: Instant,
}

#[derive(Debug, Default)]
struct Topic {
    ready: VecDeque<Pending>,
    in_flight: HashMap<DeliveryId, Pending>,
    acked: Vec<TransportMessage>,
    dead_letters: Vec<DeadLetter>,
}

impl Topic {
    fn settle(&mut self, id: DeliveryId) -> Result<Pending> {
        self.in_flight
            .remove(&id)
            .ok_or(TransportError::UnknownDelivery(id))
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_on_publish: AtomicBool,
    unavailable_polls: AtomicU32,
    closed: AtomicBool,
}

/// In-process broker with one queue per message type.
///
/// Messages are routed by their type header. Requeued messages become
/// visible again once their delay has elapsed; dead-lettered and acknowledged
/// messages are kept for inspection.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    arrivals: Arc<Notify>,
    next_delivery: Arc<AtomicU64>,
    faults: Arc<Faults>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a consumer for the queue of `topic`.
    pub fn consumer(&self, topic: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    /// Enqueues a raw transport message on the queue named by its type header.
    pub async fn publish_transport(&self, message: TransportMessage) -> Result<()> {
        if self.faults.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let topic = message.message_type()?;
        self.enqueue(&topic, message).await;
        Ok(())
    }

    /// Enqueues a message on `topic` regardless of its headers.
    pub async fn enqueue(&self, topic: &str, message: TransportMessage) {
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .ready
            .push_back(Pending {
                message,
                attempts: 0,
                available_at: Instant::now(),
            });
        self.arrivals.notify_waiters();
    }

    /// Configures publishes through [`MessagePublisher`] to fail.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.faults.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `polls` receive calls fail as unavailable.
    pub fn set_unavailable_polls(&self, polls: u32) {
        self.faults.unavailable_polls.store(polls, Ordering::SeqCst);
    }

    /// Closes the broker: receives and publishes fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.faults.closed.store(true, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }

    /// Messages waiting on `topic`, including delayed ones.
    pub async fn pending_count(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.ready.len()).await
    }

    pub async fn in_flight_count(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.in_flight.len()).await
    }

    pub async fn acked(&self, topic: &str) -> Vec<TransportMessage> {
        self.with_topic(topic, |t| t.acked.clone()).await
    }

    pub async fn dead_letters(&self, topic: &str) -> Vec<DeadLetter> {
        self.with_topic(topic, |t| t.dead_letters.clone()).await
    }

    async fn with_topic<T: Default>(&self, topic: &str, f: impl FnOnce(&Topic) -> T) -> T {
        self.topics.lock().await.get(topic).map(f).unwrap_or_default()
    }

    fn take_unavailable_poll(&self) -> bool {
        self.faults
            .unavailable_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Pops the first message of `topic` that is due, or returns the instant
    /// the earliest delayed one becomes due.
    async fn try_take(&self, topic: &str) -> std::result::Result<Delivery, Option<Instant>> {
        let now = Instant::now();
        let mut topics = self.topics.lock().await;
        let Some(queue) = topics.get_mut(topic) else {
            return Err(None);
        };

        let Some(position) = queue.ready.iter().position(|p| p.available_at <= now) else {
            return Err(queue.ready.iter().map(|p| p.available_at).min());
        };
        let Some(mut pending) = queue.ready.remove(position) else {
            return Err(None);
        };

        pending.attempts += 1;
        let id = DeliveryId(self.next_delivery.fetch_add(1, Ordering::SeqCst));
        let delivery = Delivery {
            id,
            message: pending.message.clone(),
            attempt: pending.attempts,
        };
        queue.in_flight.insert(id, pending);
        Ok(delivery)
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, message: &MessageEnvelope) -> saga::Result<()> {
        if self.faults.fail_on_publish.load(Ordering::SeqCst) {
            return Err(SagaError::TransportTransient(
                "publishing is disabled".to_string(),
            ));
        }
        let message = TransportMessage::from_envelope(message)?;
        Ok(self.publish_transport(message).await?)
    }
}

/// [`Consumer`] for one queue of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
}

impl InMemoryConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// `now + delay`, saturating at a far-future instant instead of overflowing.
fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(30 * 365 * 24 * 3600))
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = instant_after(timeout);

        loop {
            if self.broker.faults.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            if self.broker.take_unavailable_poll() {
                return Err(TransportError::Unavailable(format!(
                    "topic '{}' is not available yet",
                    self.topic
                )));
            }

            // Register interest before looking, so a publish in between is not missed.
            let arrival = self.broker.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let wake_at = match self.broker.try_take(&self.topic).await {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_due) => next_due.map_or(deadline, |due| due.min(deadline)),
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut topics = self.broker.topics.lock().await;
        let topic = topics.entry(self.topic.clone()).or_default();
        let pending = topic.settle(delivery.id)?;
        topic.acked.push(pending.message);
        Ok(())
    }

    async fn requeue(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        {
            let mut topics = self.broker.topics.lock().await;
            let topic = topics.entry(self.topic.clone()).or_default();
            let mut pending = topic.settle(delivery.id)?;
            pending.available_at = instant_after(delay);
            topic.ready.push_back(pending);
        }
        self.broker.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<()> {
        let mut topics = self.broker.topics.lock().await;
        let topic = topics.entry(self.topic.clone()).or_default();
        let pending = topic.settle(delivery.id)?;
        topic.dead_letters.push(DeadLetter {
            message: pending.message,
            reason: reason.to_string(),
            attempts: pending.attempts,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_TYPE_HEADER;

    fn message(topic: &str) -> TransportMessage {
        TransportMessage::new(b"{}".to_vec()).with_header(MESSAGE_TYPE_HEADER, topic)
    }

    #[tokio::test]
    async fn routes_by_type_header() {
        let broker = InMemoryBroker::new();
        broker.publish_transport(message("A")).await.unwrap();
        broker.publish_transport(message("B")).await.unwrap();

        assert_eq!(broker.pending_count("A").await, 1);
        assert_eq!(broker.pending_count("B").await, 1);
    }

    #[tokio::test]
    async fn publish_without_type_header_fails() {
        let broker = InMemoryBroker::new();
        let result = broker.publish_transport(TransportMessage::new(Vec::new())).await;
        assert!(matches!(result, Err(TransportError::MissingTypeHeader)));
    }

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let consumer = InMemoryBroker::new().consumer("A");
        let started = Instant::now();

        let received = consumer.receive(Duration::from_millis(30)).await.unwrap();

        assert!(received.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn receive_wakes_up_on_publish() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_transport(message("A")).await.unwrap();
        });

        let delivery = consumer.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(delivery.unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn ack_removes_message() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");
        broker.publish_transport(message("A")).await.unwrap();

        let delivery = consumer.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(broker.in_flight_count("A").await, 1);
        consumer.ack(&delivery).await.unwrap();

        assert_eq!(broker.in_flight_count("A").await, 0);
        assert_eq!(broker.pending_count("A").await, 0);
        assert_eq!(broker.acked("A").await.len(), 1);
        assert!(matches!(
            consumer.ack(&delivery).await,
            Err(TransportError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn requeued_message_returns_after_delay_with_higher_attempt() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");
        broker.publish_transport(message("A")).await.unwrap();

        let first = consumer.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        consumer.requeue(first, Duration::from_millis(40)).await.unwrap();

        assert!(consumer.receive(Duration::from_millis(5)).await.unwrap().is_none());
        let second = consumer.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn huge_timeout_and_delay_do_not_overflow() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");
        broker.publish_transport(message("A")).await.unwrap();

        let delivery = consumer.receive(Duration::MAX).await.unwrap().unwrap();
        consumer.requeue(delivery, Duration::MAX).await.unwrap();

        assert_eq!(broker.pending_count("A").await, 1);
        assert!(consumer.receive(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_keeps_reason_and_attempts() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");
        broker.publish_transport(message("A")).await.unwrap();

        let delivery = consumer.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        consumer.dead_letter(delivery, "bad payload").await.unwrap();

        let dead = broker.dead_letters("A").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "bad payload");
        assert_eq!(dead[0].attempts, 1);
    }

    #[tokio::test]
    async fn unavailable_polls_fail_then_recover() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");
        broker.set_unavailable_polls(2);

        for _ in 0..2 {
            let err = consumer.receive(Duration::from_millis(5)).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(consumer.receive(Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test]
    async fn closed_broker_rejects_receive() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("A");
        broker.close();

        assert!(matches!(
            consumer.receive(Duration::from_millis(5)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn failing_publisher_leaves_queue_untouched() {
        let broker = InMemoryBroker::new();
        broker.set_fail_on_publish(true);
        let envelope = MessageEnvelope::builder()
            .message_type("A")
            .correlation_id(saga_store::CorrelationId::new())
            .payload_raw(serde_json::json!({}))
            .build();

        let err = MessagePublisher::publish(&broker, &envelope).await.unwrap_err();

        assert_eq!(err.kind(), saga::ErrorKind::TransportTransient);
        assert_eq!(broker.pending_count("A").await, 0);
    }
}
