//! End-to-end tests: broker, subscribers, processor, outbox and dispatcher.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use host::demo::{OrderSaga, OrderStatus, PaymentSaga, PlaceOrder, register_demo_sagas};
use host::{Runtime, RuntimeConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{Envelope, HandlerRegistry, MessageBus, MessagePublisher, SagaRepository};
use saga_store::{CorrelationId, InMemoryStore};
use transport::{Consumer, InMemoryBroker, SubscriberState};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_timeout: Duration::from_millis(20),
        consume_delay: Duration::from_millis(5),
        outbox_interval: Duration::from_millis(10),
        ..RuntimeConfig::default()
    }
}

struct TestHarness {
    store: InMemoryStore,
    broker: InMemoryBroker,
    runtime: Runtime,
}

impl TestHarness {
    async fn start() -> Self {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let mut registry = HandlerRegistry::new();
        register_demo_sagas(&mut registry);

        let consumers = broker.clone();
        let runtime = Runtime::start(
            &fast_config(),
            store.clone(),
            Arc::new(registry),
            broker.clone(),
            move |message_type| Arc::new(consumers.consumer(message_type)) as Arc<dyn Consumer>,
        )
        .await
        .unwrap();

        Self {
            store,
            broker,
            runtime,
        }
    }

    async fn place_order(&self, quantity: u32) -> CorrelationId {
        let order = Envelope::new(
            CorrelationId::new(),
            PlaceOrder {
                sku: "SKU-001".to_string(),
                quantity,
                unit_price_cents: 1250,
            },
        );
        self.broker.publish(&order.to_raw().unwrap()).await.unwrap();
        order.correlation_id
    }

    async fn wait_for_order_status(&self, id: CorrelationId, status: OrderStatus) {
        let repository = SagaRepository::new(self.store.clone());
        for _ in 0..500 {
            if let Some(state) = repository.load::<OrderSaga>(id).await.unwrap() {
                if state.data().status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("order {id} never reached {status:?}");
    }
}

#[tokio::test]
async fn test_order_flows_through_both_sagas() {
    let metrics = get_metrics_handle();
    let h = TestHarness::start().await;

    let order_id = h.place_order(2).await;
    h.wait_for_order_status(order_id, OrderStatus::Confirmed).await;

    let repository = SagaRepository::new(h.store.clone());
    let order = repository.load::<OrderSaga>(order_id).await.unwrap().unwrap();
    assert!(order.is_completed());
    assert_eq!(order.data().amount_cents, 2500);
    assert_eq!(order.processed_message_ids().len(), 2);

    let payment = repository.load::<PaymentSaga>(order_id).await.unwrap().unwrap();
    assert!(payment.is_completed());
    assert_eq!(payment.data().charged_cents, 2500);

    // OrderConfirmed has no subscriber; it waits on its own queue once dispatched.
    for _ in 0..500 {
        if h.broker.pending_count("OrderConfirmed").await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.broker.pending_count("OrderConfirmed").await, 1);
    assert_eq!(h.store.unsent_count().await, 0);

    h.runtime.shutdown().await;

    let rendered = metrics.render();
    assert!(rendered.contains("saga_messages_processed_total"));
    assert!(rendered.contains("outbox_messages_dispatched_total"));
    assert!(rendered.contains("subscriber_messages_acked_total"));
}

#[tokio::test]
async fn test_order_published_through_bus_is_delivered_by_dispatcher() {
    let h = TestHarness::start().await;

    let order = Envelope::new(
        CorrelationId::new(),
        PlaceOrder {
            sku: "SKU-003".to_string(),
            quantity: 3,
            unit_price_cents: 400,
        },
    );
    let mut bus = MessageBus::new(h.store.clone());
    let entry_id = bus.publish(&order).await.unwrap();

    h.wait_for_order_status(order.correlation_id, OrderStatus::Confirmed)
        .await;

    let repository = SagaRepository::new(h.store.clone());
    let saga = repository
        .load::<OrderSaga>(order.correlation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saga.data().amount_cents, 1200);

    let entries = h.store.outbox_entries().await;
    let placed = entries.iter().find(|e| e.id == entry_id).unwrap();
    assert_eq!(placed.message.message_id, order.id);
    assert!(placed.sent_at.is_some());

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_rejected_order_is_dead_lettered() {
    let h = TestHarness::start().await;

    h.place_order(0).await;
    for _ in 0..500 {
        if !h.broker.dead_letters("PlaceOrder").await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let dead = h.broker.dead_letters("PlaceOrder").await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("at least one item"));
    assert!(h.store.outbox_entries().await.is_empty());

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_one_subscriber_per_message_type() {
    let h = TestHarness::start().await;

    let states = h.runtime.subscriber_states();
    let types: Vec<_> = states.iter().map(|(t, _)| *t).collect();
    assert_eq!(types, vec!["ChargePayment", "PaymentCharged", "PlaceOrder"]);
    assert!(
        states
            .iter()
            .all(|(_, s)| matches!(s, SubscriberState::Started | SubscriberState::Consuming))
    );

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_unconsumed_messages_queued() {
    let h = TestHarness::start().await;
    h.runtime.shutdown().await;

    let order = Envelope::new(
        CorrelationId::new(),
        PlaceOrder {
            sku: "SKU-002".to_string(),
            quantity: 1,
            unit_price_cents: 100,
        },
    );
    h.broker.publish(&order.to_raw().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.broker.pending_count("PlaceOrder").await, 1);
    assert!(h.store.outbox_entries().await.is_empty());
}
