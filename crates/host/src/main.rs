//! Saga host entry point.

use std::sync::Arc;

use host::demo::{PlaceOrder, register_demo_sagas};
use host::{Runtime, RuntimeConfig};
use saga::{Envelope, HandlerRegistry, MessageBus};
use saga_store::{CorrelationId, InMemoryStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transport::{Consumer, InMemoryBroker};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = RuntimeConfig::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    host::install_metrics(config.metrics_addr).expect("failed to install Prometheus recorder");

    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let mut registry = HandlerRegistry::new();
    register_demo_sagas(&mut registry);

    let mut bus = MessageBus::new(store.clone());
    let consumers = broker.clone();
    let runtime = Runtime::start(
        &config,
        store,
        Arc::new(registry),
        broker,
        move |message_type| Arc::new(consumers.consumer(message_type)) as Arc<dyn Consumer>,
    )
    .await
    .expect("failed to start saga runtime");

    let order = Envelope::new(
        CorrelationId::new(),
        PlaceOrder {
            sku: "SKU-001".to_string(),
            quantity: 2,
            unit_price_cents: 1250,
        },
    );
    // Recorded in the outbox; the dispatcher delivers it to the broker.
    match bus.publish(&order).await {
        Ok(entry_id) => tracing::info!(
            correlation_id = %order.correlation_id,
            %entry_id,
            "sample order placed"
        ),
        Err(e) => tracing::error!(error = %e, "failed to place sample order"),
    }

    shutdown_signal().await;
    runtime.shutdown().await;

    tracing::info!("saga host shut down gracefully");
}
