//! Typed access to saga state on top of a [`SagaStore`].

use saga_store::{CorrelationId, LockToken, SagaRecord, SagaStore, StoreError, Version};

use crate::error::{Result, SagaError};
use crate::handler::Saga;
use crate::state::SagaState;

/// Loads, locks and saves [`SagaState`] for a saga type.
///
/// The store is the only arbiter of ownership: `get_or_create` takes the
/// lease, `save` is refused once the token is stale, and `release` gives the
/// lease back.
#[derive(Clone)]
pub struct SagaRepository<S> {
    store: S,
}

impl<S: SagaStore> SagaRepository<S> {
    /// Creates a repository over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads the state of a saga instance, or creates a fresh one, and takes
    /// exclusive access to it.
    ///
    /// Fails with [`SagaError::LockConflict`] while another attempt holds it.
    pub async fn get_or_create<G: Saga>(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<(SagaState<G::Data>, LockToken)> {
        let (record, token) = self.store.lock(G::SAGA_TYPE, correlation_id).await?;

        let state = match record {
            None => SagaState::new(correlation_id, G::Data::default()),
            Some(record) => match serde_json::from_value(record.state) {
                Ok(state) => state,
                Err(e) => {
                    if let Err(release) = self.release(token).await {
                        tracing::warn!(
                            saga_type = G::SAGA_TYPE,
                            %correlation_id,
                            error = %release,
                            "failed to release saga lock after unreadable state"
                        );
                    }
                    return Err(SagaError::Persistence(StoreError::Serialization(e)));
                }
            },
        };
        Ok((state, token))
    }

    /// Persists `state` if `token` is still valid.
    pub async fn save<G: Saga>(
        &self,
        state: &SagaState<G::Data>,
        token: &LockToken,
        transaction: Option<&mut S::Transaction>,
    ) -> Result<Version> {
        if token.saga_type != G::SAGA_TYPE || token.correlation_id != state.id() {
            return Err(SagaError::InvariantViolation(format!(
                "lock token for {}/{} cannot save {}/{}",
                token.saga_type,
                token.correlation_id,
                G::SAGA_TYPE,
                state.id()
            )));
        }

        let value = serde_json::to_value(state)
            .map_err(|e| SagaError::Persistence(StoreError::Serialization(e)))?;
        let record = SagaRecord::new(G::SAGA_TYPE, state.id(), value);

        Ok(self.store.save(record, token, transaction).await?)
    }

    /// Gives up exclusive access.
    pub async fn release(&self, token: LockToken) -> Result<()> {
        Ok(self.store.release(token).await?)
    }

    /// Reads the committed state of a saga instance without locking it.
    pub async fn load<G: Saga>(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaState<G::Data>>> {
        let Some(record) = self.store.load(G::SAGA_TYPE, correlation_id).await? else {
            return Ok(None);
        };
        let state = serde_json::from_value(record.state)
            .map_err(|e| SagaError::Persistence(StoreError::Serialization(e)))?;
        Ok(Some(state))
    }
}
