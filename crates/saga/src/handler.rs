//! Traits implemented by user sagas.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::{Envelope, Message};
use crate::state::SagaState;

/// Error returned by saga handlers.
///
/// Any error type can be returned with `?`. Returning a
/// [`crate::SagaError`] lock conflict marks the attempt as retryable; every
/// other error fails the attempt as a handler error.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A saga type: a workflow whose state is keyed by correlation ID.
pub trait Saga: Send + Sync + 'static {
    /// Name under which this saga's state is stored.
    const SAGA_TYPE: &'static str;

    /// Business state of one instance. A default value seeds new instances.
    type Data: Default + Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Implemented by a saga for every message type it reacts to.
///
/// The handler decides what the message means for the saga: it may mutate
/// `state.data_mut()`, buffer outbound messages with
/// [`SagaState::enqueue_outbound`] and finish the workflow with
/// [`SagaState::mark_completed`]. It must not publish to a transport directly;
/// buffered messages are committed with the state and dispatched later.
#[async_trait]
pub trait Handles<M: Message>: Saga {
    async fn handle(
        &self,
        state: &mut SagaState<Self::Data>,
        message: &Envelope<M>,
    ) -> Result<(), HandlerError>;
}
