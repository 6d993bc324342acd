//! Resolution of message types to the sagas that handle them.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use saga_store::{MessageEnvelope, Persistence};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::handler::Handles;
use crate::message::Message;
use crate::processor::{ProcessOutcome, run_attempt};
use crate::repository::SagaRepository;

/// One (saga type, message type) pair, erased so routes for different sagas
/// can share a list.
#[async_trait]
pub(crate) trait SagaRoute<S: Persistence>: Send + Sync {
    fn saga_type(&self) -> &'static str;

    async fn process(
        &self,
        repository: &SagaRepository<S>,
        message: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome>;
}

struct TypedRoute<G, M> {
    saga: Arc<G>,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<S, G, M> SagaRoute<S> for TypedRoute<G, M>
where
    S: Persistence + 'static,
    G: Handles<M>,
    M: Message,
{
    fn saga_type(&self) -> &'static str {
        G::SAGA_TYPE
    }

    async fn process(
        &self,
        repository: &SagaRepository<S>,
        message: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        run_attempt::<S, G, M>(repository, self.saga.as_ref(), message, cancel).await
    }
}

/// Maps each logical message type to every saga that handles it.
///
/// # Example
///
/// ```ignore
/// let saga = Arc::new(OrderSaga::default());
/// let mut registry = HandlerRegistry::new();
/// registry
///     .register::<_, PlaceOrder>(Arc::clone(&saga))
///     .register::<_, ConfirmPayment>(saga);
/// ```
pub struct HandlerRegistry<S> {
    routes: BTreeMap<&'static str, Vec<Arc<dyn SagaRoute<S>>>>,
}

impl<S: Persistence + 'static> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Persistence + 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    /// Registers `saga` as a handler of `M`.
    ///
    /// Registering the same saga type for the same message type again
    /// replaces the earlier handler.
    pub fn register<G, M>(&mut self, saga: Arc<G>) -> &mut Self
    where
        G: Handles<M>,
        M: Message,
    {
        let route: Arc<dyn SagaRoute<S>> = Arc::new(TypedRoute::<G, M> {
            saga,
            _message: PhantomData,
        });

        let routes = self.routes.entry(M::MESSAGE_TYPE).or_default();
        match routes.iter_mut().find(|r| r.saga_type() == G::SAGA_TYPE) {
            Some(existing) => {
                tracing::debug!(
                    saga_type = G::SAGA_TYPE,
                    message_type = M::MESSAGE_TYPE,
                    "replacing registered handler"
                );
                *existing = route;
            }
            None => routes.push(route),
        }
        self
    }

    /// Returns true if at least one saga handles `message_type`.
    pub fn contains(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    /// Every registered message type, in name order.
    pub fn message_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    /// Names of the sagas that handle `message_type`, in registration order.
    pub fn saga_types_for(&self, message_type: &str) -> Vec<&'static str> {
        self.resolve(message_type)
            .iter()
            .map(|route| route.saga_type())
            .collect()
    }

    pub(crate) fn resolve(&self, message_type: &str) -> &[Arc<dyn SagaRoute<S>>] {
        self.routes
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, Saga};
    use crate::message::Envelope;
    use crate::state::SagaState;
    use saga_store::InMemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl Message for Ping {
        const MESSAGE_TYPE: &'static str = "Ping";
    }

    #[derive(Serialize, Deserialize)]
    struct Pong;

    impl Message for Pong {
        const MESSAGE_TYPE: &'static str = "Pong";
    }

    struct Echo;

    impl Saga for Echo {
        const SAGA_TYPE: &'static str = "Echo";
        type Data = ();
    }

    #[async_trait]
    impl Handles<Ping> for Echo {
        async fn handle(
            &self,
            _state: &mut SagaState<()>,
            _message: &Envelope<Ping>,
        ) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Handles<Pong> for Echo {
        async fn handle(
            &self,
            _state: &mut SagaState<()>,
            _message: &Envelope<Pong>,
        ) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    struct Audit;

    impl Saga for Audit {
        const SAGA_TYPE: &'static str = "Audit";
        type Data = ();
    }

    #[async_trait]
    impl Handles<Ping> for Audit {
        async fn handle(
            &self,
            _state: &mut SagaState<()>,
            _message: &Envelope<Ping>,
        ) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn resolves_every_saga_for_a_message_type() {
        let mut registry = HandlerRegistry::<InMemoryStore>::new();
        let echo = Arc::new(Echo);
        registry
            .register::<_, Ping>(Arc::clone(&echo))
            .register::<_, Pong>(echo)
            .register::<_, Ping>(Arc::new(Audit));

        assert_eq!(registry.saga_types_for("Ping"), vec!["Echo", "Audit"]);
        assert_eq!(registry.saga_types_for("Pong"), vec!["Echo"]);
        assert_eq!(registry.message_types().collect::<Vec<_>>(), vec!["Ping", "Pong"]);
    }

    #[test]
    fn unknown_type_resolves_to_nothing() {
        let registry = HandlerRegistry::<InMemoryStore>::new();
        assert!(!registry.contains("Ping"));
        assert!(registry.saga_types_for("Ping").is_empty());
    }

    #[test]
    fn registering_twice_replaces_the_route() {
        let mut registry = HandlerRegistry::<InMemoryStore>::new();
        registry
            .register::<_, Ping>(Arc::new(Echo))
            .register::<_, Ping>(Arc::new(Echo));

        assert_eq!(registry.saga_types_for("Ping"), vec!["Echo"]);
    }
}
