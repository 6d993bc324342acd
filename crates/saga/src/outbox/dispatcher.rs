use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use saga_store::{MessageEnvelope, OutboxEntry, OutboxStore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::tick_period;
use crate::error::Result;

/// The real transport, as seen by the dispatcher.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes one message. `Ok` means the transport accepted it.
    async fn publish(&self, message: &MessageEnvelope) -> Result<()>;
}

#[async_trait]
impl<P: MessagePublisher + ?Sized> MessagePublisher for Arc<P> {
    async fn publish(&self, message: &MessageEnvelope) -> Result<()> {
        (**self).publish(message).await
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct OutboxDispatcherOptions {
    /// Time between dispatch cycles.
    pub interval: Duration,
    /// Maximum number of entries published per cycle.
    pub batch_size: usize,
}

impl Default for OutboxDispatcherOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

/// Result of one dispatch cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub failed: usize,
}

/// Moves unsent outbox entries to the transport.
///
/// Delivery is at least once: an entry whose publish fails stays unsent and
/// is retried next cycle, and an entry published but not marked sent (crash,
/// storage error) is published again.
pub struct OutboxDispatcher<O, P> {
    outbox: O,
    publisher: P,
    options: OutboxDispatcherOptions,
}

impl<O, P> OutboxDispatcher<O, P>
where
    O: OutboxStore + 'static,
    P: MessagePublisher + 'static,
{
    pub fn new(outbox: O, publisher: P, options: OutboxDispatcherOptions) -> Self {
        Self {
            outbox,
            publisher,
            options,
        }
    }

    pub fn options(&self) -> &OutboxDispatcherOptions {
        &self.options
    }

    /// Runs a single cycle: publishes up to `batch_size` unsent entries,
    /// oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        let entries = self.outbox.list_unsent(self.options.batch_size).await?;
        let mut report = DispatchReport::default();

        for entry in entries {
            if self.dispatch_entry(&entry).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.published > 0 || report.failed > 0 {
            tracing::info!(
                published = report.published,
                failed = report.failed,
                "outbox dispatch cycle finished"
            );
        }
        Ok(report)
    }

    async fn dispatch_entry(&self, entry: &OutboxEntry) -> bool {
        if let Err(e) = self.publisher.publish(&entry.message).await {
            metrics::counter!("outbox_dispatch_failures_total").increment(1);
            tracing::warn!(
                entry_id = %entry.id,
                message_type = %entry.message.message_type,
                error = %e,
                "failed to publish outbox entry"
            );
            return false;
        }

        match self.outbox.mark_sent(entry.id, Utc::now()).await {
            Ok(()) => {
                metrics::counter!("outbox_messages_dispatched_total").increment(1);
                true
            }
            Err(e) => {
                metrics::counter!("outbox_dispatch_failures_total").increment(1);
                tracing::error!(
                    entry_id = %entry.id,
                    error = %e,
                    "published outbox entry could not be marked sent"
                );
                false
            }
        }
    }

    /// Spawns the dispatch loop. It stops once `shutdown` is cancelled,
    /// after the cycle in flight has finished.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval = ?self.options.interval, "outbox dispatcher started");
            let mut ticker = tokio::time::interval(tick_period(self.options.interval));
            // A slow cycle pushes the next one back instead of stacking ticks.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.dispatch_once().await {
                            tracing::error!(error = %e, "outbox dispatch cycle failed");
                        }
                    }
                }
            }
            tracing::info!("outbox dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SagaError;
    use saga_store::{CorrelationId, InMemoryStore};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<MessageEnvelope>>,
        fail: AtomicBool,
    }

    impl RecordingPublisher {
        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(&self, message: &MessageEnvelope) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SagaError::TransportTransient("broker down".to_string()));
            }
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn message(n: u32) -> MessageEnvelope {
        MessageEnvelope::builder()
            .message_type("Numbered")
            .correlation_id(CorrelationId::new())
            .payload_raw(serde_json::json!({ "n": n }))
            .build()
    }

    async fn seeded(count: u32) -> InMemoryStore {
        let store = InMemoryStore::new();
        for n in 0..count {
            store.append(message(n), None).await.unwrap();
        }
        store
    }

    fn dispatcher(
        store: &InMemoryStore,
        publisher: &Arc<RecordingPublisher>,
        batch_size: usize,
    ) -> OutboxDispatcher<InMemoryStore, Arc<RecordingPublisher>> {
        OutboxDispatcher::new(
            store.clone(),
            Arc::clone(publisher),
            OutboxDispatcherOptions {
                interval: Duration::from_millis(10),
                batch_size,
            },
        )
    }

    #[tokio::test]
    async fn publishes_oldest_first_and_marks_sent() {
        let store = seeded(3).await;
        let publisher = Arc::new(RecordingPublisher::default());

        let report = dispatcher(&store, &publisher, 10).dispatch_once().await.unwrap();

        assert_eq!(report, DispatchReport { published: 3, failed: 0 });
        assert_eq!(store.unsent_count().await, 0);
        let published = publisher.published.lock().unwrap();
        let order: Vec<_> = published.iter().map(|m| m.payload["n"].clone()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn respects_batch_size() {
        let store = seeded(5).await;
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = dispatcher(&store, &publisher, 2);

        dispatcher.dispatch_once().await.unwrap();
        assert_eq!(store.unsent_count().await, 3);

        dispatcher.dispatch_once().await.unwrap();
        dispatcher.dispatch_once().await.unwrap();
        assert_eq!(store.unsent_count().await, 0);
        assert_eq!(publisher.count(), 5);
    }

    #[tokio::test]
    async fn failed_publish_stays_unsent_and_is_retried() {
        let store = seeded(1).await;
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = dispatcher(&store, &publisher, 10);

        publisher.set_fail(true);
        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report, DispatchReport { published: 0, failed: 1 });
        assert_eq!(store.unsent_count().await, 1);

        publisher.set_fail(false);
        dispatcher.dispatch_once().await.unwrap();
        assert_eq!(store.unsent_count().await, 0);

        // Sent entries are never published again.
        dispatcher.dispatch_once().await.unwrap();
        assert_eq!(publisher.count(), 1);
    }

    #[tokio::test]
    async fn loop_drains_outbox_and_stops_on_shutdown() {
        let store = seeded(2).await;
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = CancellationToken::new();

        let handle = Arc::new(dispatcher(&store, &publisher, 10)).start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(store.unsent_count().await, 0);
        assert_eq!(publisher.count(), 2);
    }

    #[tokio::test]
    async fn zero_interval_loop_still_drains_outbox() {
        let store = seeded(1).await;
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = CancellationToken::new();
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            Arc::clone(&publisher),
            OutboxDispatcherOptions {
                interval: Duration::ZERO,
                batch_size: 10,
            },
        );

        let handle = Arc::new(dispatcher).start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(store.unsent_count().await, 0);
        assert_eq!(publisher.count(), 1);
    }
}
