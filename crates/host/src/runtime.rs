//! Wiring and lifecycle of every background task.

use std::sync::Arc;

use saga::{
    HandlerRegistry, MessageProcessor, MessagePublisher, OutboxCleaner, OutboxDispatcher,
};
use saga_store::Persistence;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{Consumer, MessageParser, Subscriber, SubscriberState};

use crate::config::RuntimeConfig;
use crate::error::HostError;

/// The running system: one subscriber per registered message type, plus the
/// outbox dispatcher and cleaner.
///
/// Every loop is an independent task. [`Runtime::shutdown`] stops the
/// subscribers first, waiting for in-flight messages, so the outbox loops
/// still run while the last messages commit.
pub struct Runtime {
    subscribers: Vec<Subscriber>,
    subscriber_shutdown: CancellationToken,
    background_shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Starts all loops.
    ///
    /// `consumer_for` is called once per registered message type and must
    /// return a consumer for that type's queue.
    pub async fn start<S, P, F>(
        config: &RuntimeConfig,
        store: S,
        registry: Arc<HandlerRegistry<S>>,
        publisher: P,
        consumer_for: F,
    ) -> Result<Self, HostError>
    where
        S: Persistence + Clone + 'static,
        P: MessagePublisher + 'static,
        F: Fn(&str) -> Arc<dyn Consumer>,
    {
        let background_shutdown = CancellationToken::new();
        let subscriber_shutdown = CancellationToken::new();

        let dispatcher = Arc::new(OutboxDispatcher::new(
            store.clone(),
            publisher,
            config.dispatcher_options(),
        ));
        let cleaner = Arc::new(OutboxCleaner::new(store.clone(), config.cleaner_options()));
        let background = vec![
            dispatcher.start(background_shutdown.clone()),
            cleaner.start(background_shutdown.clone()),
        ];

        let mut runtime = Self {
            subscribers: Vec::new(),
            subscriber_shutdown,
            background_shutdown,
            background,
        };

        let processor = Arc::new(MessageProcessor::new(store, Arc::clone(&registry)));
        let parser = MessageParser::new(registry.clone());

        for message_type in registry.message_types() {
            let subscriber = Subscriber::new(
                message_type,
                consumer_for(message_type),
                processor.clone(),
                parser.clone(),
                config.subscriber_config(),
            );
            if let Err(e) = subscriber.start(&runtime.subscriber_shutdown).await {
                runtime.shutdown().await;
                return Err(e.into());
            }
            runtime.subscribers.push(subscriber);
        }

        tracing::info!(
            subscribers = runtime.subscribers.len(),
            "saga runtime started"
        );
        Ok(runtime)
    }

    /// Message types being consumed and the state of their subscriber.
    pub fn subscriber_states(&self) -> Vec<(&str, SubscriberState)> {
        self.subscribers
            .iter()
            .map(|s| (s.message_type(), s.state()))
            .collect()
    }

    /// Stops subscribers, then the outbox loops, and waits for all of them.
    pub async fn shutdown(self) {
        tracing::info!("saga runtime shutting down");

        self.subscriber_shutdown.cancel();
        futures_util::future::join_all(self.subscribers.iter().map(|s| s.stop())).await;

        self.background_shutdown.cancel();
        for result in futures_util::future::join_all(self.background).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "background task failed");
            }
        }

        tracing::info!("saga runtime stopped");
    }
}
