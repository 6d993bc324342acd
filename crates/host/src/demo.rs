//! A small order workflow used by the binary and the end-to-end tests.
//!
//! `PlaceOrder` starts an [`OrderSaga`], which asks for payment. The
//! [`PaymentSaga`] answers `ChargePayment` with `PaymentCharged`, and the
//! order saga then completes and announces `OrderConfirmed`.

use std::sync::Arc;

use async_trait::async_trait;
use saga::{Envelope, HandlerError, HandlerRegistry, Handles, Message, Saga, SagaState};
use saga_store::Persistence;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

impl Message for PlaceOrder {
    const MESSAGE_TYPE: &'static str = "PlaceOrder";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePayment {
    pub amount_cents: u64,
}

impl Message for ChargePayment {
    const MESSAGE_TYPE: &'static str = "ChargePayment";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCharged {
    pub amount_cents: u64,
}

impl Message for PaymentCharged {
    const MESSAGE_TYPE: &'static str = "PaymentCharged";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub amount_cents: u64,
}

impl Message for OrderConfirmed {
    const MESSAGE_TYPE: &'static str = "OrderConfirmed";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    New,
    AwaitingPayment,
    Confirmed,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OrderData {
    pub status: OrderStatus,
    pub amount_cents: u64,
}

#[derive(Debug, Default)]
pub struct OrderSaga;

impl Saga for OrderSaga {
    const SAGA_TYPE: &'static str = "OrderSaga";
    type Data = OrderData;
}

#[async_trait]
impl Handles<PlaceOrder> for OrderSaga {
    async fn handle(
        &self,
        state: &mut SagaState<OrderData>,
        message: &Envelope<PlaceOrder>,
    ) -> Result<(), HandlerError> {
        if state.data().status != OrderStatus::New {
            return Err(format!("order {} was already placed", state.id()).into());
        }
        if message.body.quantity == 0 {
            return Err("order must contain at least one item".into());
        }

        let amount_cents = message
            .body
            .unit_price_cents
            .checked_mul(u64::from(message.body.quantity))
            .ok_or("order total overflows")?;

        let data = state.data_mut();
        data.status = OrderStatus::AwaitingPayment;
        data.amount_cents = amount_cents;
        state.enqueue_outbound(Envelope::new(state.id(), ChargePayment { amount_cents }))?;
        Ok(())
    }
}

#[async_trait]
impl Handles<PaymentCharged> for OrderSaga {
    async fn handle(
        &self,
        state: &mut SagaState<OrderData>,
        message: &Envelope<PaymentCharged>,
    ) -> Result<(), HandlerError> {
        if state.data().status != OrderStatus::AwaitingPayment {
            return Err(format!("order {} is not awaiting payment", state.id()).into());
        }

        state.data_mut().status = OrderStatus::Confirmed;
        state.enqueue_outbound(Envelope::new(
            state.id(),
            OrderConfirmed {
                amount_cents: message.body.amount_cents,
            },
        ))?;
        state.mark_completed();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PaymentData {
    pub charged_cents: u64,
}

#[derive(Debug, Default)]
pub struct PaymentSaga;

impl Saga for PaymentSaga {
    const SAGA_TYPE: &'static str = "PaymentSaga";
    type Data = PaymentData;
}

#[async_trait]
impl Handles<ChargePayment> for PaymentSaga {
    async fn handle(
        &self,
        state: &mut SagaState<PaymentData>,
        message: &Envelope<ChargePayment>,
    ) -> Result<(), HandlerError> {
        state.data_mut().charged_cents += message.body.amount_cents;
        state.enqueue_outbound(Envelope::new(
            state.id(),
            PaymentCharged {
                amount_cents: message.body.amount_cents,
            },
        ))?;
        state.mark_completed();
        Ok(())
    }
}

/// Registers the demo sagas for every message they handle.
pub fn register_demo_sagas<S: Persistence + 'static>(registry: &mut HandlerRegistry<S>) {
    let order = Arc::new(OrderSaga);
    registry
        .register::<_, PlaceOrder>(Arc::clone(&order))
        .register::<_, PaymentCharged>(order)
        .register::<_, ChargePayment>(Arc::new(PaymentSaga));
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_store::{CorrelationId, InMemoryStore};

    fn place(quantity: u32) -> Envelope<PlaceOrder> {
        Envelope::new(
            CorrelationId::new(),
            PlaceOrder {
                sku: "SKU-001".to_string(),
                quantity,
                unit_price_cents: 1250,
            },
        )
    }

    #[tokio::test]
    async fn test_place_order_requests_payment() {
        let message = place(2);
        let mut state = SagaState::new(message.correlation_id, OrderData::default());

        OrderSaga.handle(&mut state, &message).await.unwrap();

        assert_eq!(state.data().status, OrderStatus::AwaitingPayment);
        assert_eq!(state.data().amount_cents, 2500);
        assert_eq!(state.outbox().len(), 1);
        assert_eq!(state.outbox()[0].message_type, "ChargePayment");
        assert!(!state.is_completed());
    }

    #[tokio::test]
    async fn test_empty_order_is_rejected() {
        let message = place(0);
        let mut state = SagaState::new(message.correlation_id, OrderData::default());

        assert!(OrderSaga.handle(&mut state, &message).await.is_err());
        assert!(state.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_payment_completes_order() {
        let id = CorrelationId::new();
        let mut state = SagaState::new(
            id,
            OrderData {
                status: OrderStatus::AwaitingPayment,
                amount_cents: 900,
            },
        );

        let charged = Envelope::new(id, PaymentCharged { amount_cents: 900 });
        OrderSaga.handle(&mut state, &charged).await.unwrap();

        assert!(state.is_completed());
        assert_eq!(state.data().status, OrderStatus::Confirmed);
        assert_eq!(state.outbox()[0].message_type, "OrderConfirmed");
    }

    #[test]
    fn test_registry_covers_demo_messages() {
        let mut registry = HandlerRegistry::<InMemoryStore>::new();
        register_demo_sagas(&mut registry);

        assert_eq!(
            registry.message_types().collect::<Vec<_>>(),
            vec!["ChargePayment", "PaymentCharged", "PlaceOrder"]
        );
        assert_eq!(registry.saga_types_for("ChargePayment"), vec!["PaymentSaga"]);
    }
}
