//! The consume loop and its retry/requeue protocol.

use std::sync::Arc;
use std::time::Duration;

use saga::{ErrorKind, Processor, SagaError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SubscriberConfig;
use crate::consumer::{Consumer, Delivery};
use crate::error::{Result, TransportError};
use crate::parser::MessageParser;

/// Lifecycle of a [`Subscriber`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Started,
    Consuming,
    Stopped,
}

/// What to do with a delivery whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Lock contention: redeliver with backoff, indefinitely.
    Retry,
    /// The attempt was cancelled by shutdown: hand it back untouched.
    Release,
    /// Storage trouble: redeliver with backoff, up to a limit.
    Redeliver,
    DeadLetter,
}

impl Disposition {
    fn of(error: &SagaError) -> Self {
        if error.is_lock_conflict() {
            Disposition::Retry
        } else if error.has_kind(ErrorKind::Cancelled) {
            Disposition::Release
        } else if error.has_kind(ErrorKind::Persistence)
            || error.has_kind(ErrorKind::TransportTransient)
        {
            Disposition::Redeliver
        } else {
            Disposition::DeadLetter
        }
    }
}

struct Worker {
    message_type: String,
    consumer: Arc<dyn Consumer>,
    processor: Arc<dyn Processor>,
    parser: MessageParser,
    config: SubscriberConfig,
    state: watch::Sender<SubscriberState>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Consumes one message type from a transport and feeds it to a
/// [`Processor`].
///
/// Every receive is bounded by `poll_timeout`, so cancellation is observed
/// promptly. A message being processed when [`Subscriber::stop`] is called is
/// allowed to settle; nothing is processed after `stop` returns.
pub struct Subscriber {
    worker: Arc<Worker>,
    running: Mutex<Option<Running>>,
}

impl Subscriber {
    pub fn new(
        message_type: impl Into<String>,
        consumer: Arc<dyn Consumer>,
        processor: Arc<dyn Processor>,
        parser: MessageParser,
        config: SubscriberConfig,
    ) -> Self {
        let (state, _) = watch::channel(SubscriberState::Idle);
        Self {
            worker: Arc::new(Worker {
                message_type: message_type.into(),
                consumer,
                processor,
                parser,
                config,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.worker.message_type
    }

    pub fn state(&self) -> SubscriberState {
        *self.worker.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.worker.state.subscribe()
    }

    /// Starts the consume loop. The loop also stops when `shutdown` is
    /// cancelled.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock().await;
        if self.state() != SubscriberState::Idle {
            return Err(TransportError::AlreadyStarted);
        }

        self.worker.state.send_replace(SubscriberState::Started);
        let cancel = shutdown.child_token();
        let worker = Arc::clone(&self.worker);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stops the loop and waits for the in-flight message, if any, to settle.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(Running { cancel, handle }) = running.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!(message_type = %self.worker.message_type, error = %e, "subscriber task failed");
            }
        }
        self.worker.state.send_replace(SubscriberState::Stopped);
    }
}

impl Worker {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.state.send_replace(SubscriberState::Consuming);
        tracing::info!(message_type = %self.message_type, "subscriber consuming");

        while !cancel.is_cancelled() {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.consumer.receive(self.config.poll_timeout) => received,
            };

            let pause = match received {
                Ok(Some(delivery)) => {
                    self.handle(delivery, &cancel).await;
                    None
                }
                Ok(None) => Some(self.config.consume_delay),
                Err(e) if e.is_transient() => {
                    tracing::warn!(message_type = %self.message_type, error = %e, "transport unavailable, backing off");
                    Some(self.config.transient_backoff)
                }
                Err(TransportError::Closed) => {
                    tracing::info!(message_type = %self.message_type, "transport closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(message_type = %self.message_type, error = %e, "receive failed");
                    Some(self.config.consume_delay)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        self.state.send_replace(SubscriberState::Stopped);
        tracing::info!(message_type = %self.message_type, "subscriber stopped");
    }

    #[tracing::instrument(
        skip(self, delivery, cancel),
        fields(message_type = %self.message_type, delivery_id = %delivery.id, attempt = delivery.attempt)
    )]
    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) {
        let envelope = match self.parser.parse(&delivery.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "discarding undecodable message");
                self.dead_letter(delivery, &e.to_string()).await;
                return;
            }
        };

        match self.processor.process(&envelope, cancel).await {
            Ok(report) => {
                tracing::debug!(applied = report.applied, skipped = report.skipped, "message processed");
                self.ack(&delivery).await;
            }
            Err(e) => self.settle_failure(delivery, e).await,
        }
    }

    async fn settle_failure(&self, delivery: Delivery, error: SagaError) {
        match Disposition::of(&error) {
            Disposition::Retry => {
                let delay = self.config.retry_delay(delivery.attempt);
                tracing::debug!(?delay, "saga locked, requeueing");
                self.requeue(delivery, delay).await;
            }
            Disposition::Release => self.requeue(delivery, Duration::ZERO).await,
            Disposition::Redeliver if delivery.attempt < self.config.max_redeliveries => {
                let delay = self.config.retry_delay(delivery.attempt);
                tracing::warn!(error = %error, ?delay, "processing failed, requeueing");
                self.requeue(delivery, delay).await;
            }
            Disposition::Redeliver | Disposition::DeadLetter => {
                tracing::error!(error = %error, "processing failed, dead-lettering");
                self.dead_letter(delivery, &error.to_string()).await;
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.consumer.ack(delivery).await {
            Ok(()) => {
                metrics::counter!("subscriber_messages_acked_total", "message_type" => self.message_type.clone())
                    .increment(1);
            }
            Err(e) => tracing::error!(error = %e, "failed to acknowledge message"),
        }
    }

    async fn requeue(&self, delivery: Delivery, delay: Duration) {
        match self.consumer.requeue(delivery, delay).await {
            Ok(()) => {
                metrics::counter!("subscriber_messages_requeued_total", "message_type" => self.message_type.clone())
                    .increment(1);
            }
            Err(e) => tracing::error!(error = %e, "failed to requeue message"),
        }
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) {
        match self.consumer.dead_letter(delivery, reason).await {
            Ok(()) => {
                metrics::counter!("subscriber_messages_dead_lettered_total", "message_type" => self.message_type.clone())
                    .increment(1);
            }
            Err(e) => tracing::error!(error = %e, "failed to dead-letter message"),
        }
    }
}
