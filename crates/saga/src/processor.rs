//! Message processing: one attempt per saga, from lock to commit.
//!
//! For each saga registered for the message type, an attempt moves through
//! [`ProcessingStage`]s:
//!
//! 1. `Loading` locks and loads (or creates) the saga state
//! 2. `Checking` short-circuits when the message was already applied
//! 3. `Invoking` runs the saga's handler against the loaded state
//! 4. `Committing` marks the message processed, then writes the outbox buffer
//!    and the state in one transaction
//!
//! The lock is released whether the attempt ends in `Done` or `Failed`. No
//! message reaches a transport from here; that is the dispatcher's job.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use saga_store::{
    LockToken, MessageEnvelope, MessageId, Persistence, Transaction, Transactional,
};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SagaError};
use crate::handler::{HandlerError, Handles, Saga};
use crate::message::{Envelope, Message};
use crate::registry::HandlerRegistry;
use crate::repository::SagaRepository;
use crate::state::SagaState;

/// Stage of a single processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Loading,
    Checking,
    Invoking,
    Committing,
    Done,
    Failed,
}

impl ProcessingStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStage::Done | ProcessingStage::Failed)
    }
}

/// How an attempt for one saga ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The handler ran and its effects were committed.
    Applied,
    /// The message had already been applied; nothing ran.
    AlreadyProcessed,
}

/// Summary of processing one message across every saga that handles it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Processes one inbound message.
///
/// Implemented by [`MessageProcessor`]; subscribers only depend on this trait.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Runs the message through every saga that handles its type.
    ///
    /// When more than one saga fails, the failures are returned together as
    /// [`SagaError::Multiple`].
    async fn process(
        &self,
        message: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport>;
}

/// The default [`Processor`], backed by a [`SagaRepository`] and a
/// [`HandlerRegistry`].
pub struct MessageProcessor<S> {
    repository: SagaRepository<S>,
    registry: Arc<HandlerRegistry<S>>,
}

impl<S: Persistence + 'static> MessageProcessor<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry<S>>) -> Self {
        Self {
            repository: SagaRepository::new(store),
            registry,
        }
    }

    pub fn repository(&self) -> &SagaRepository<S> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry<S>> {
        &self.registry
    }
}

#[async_trait]
impl<S: Persistence + 'static> Processor for MessageProcessor<S> {
    #[tracing::instrument(
        skip(self, message, cancel),
        fields(
            message_type = %message.message_type,
            message_id = %message.message_id,
            correlation_id = %message.correlation_id,
        )
    )]
    async fn process(
        &self,
        message: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let routes = self.registry.resolve(&message.message_type);
        if routes.is_empty() {
            return Err(SagaError::TypeResolution(message.message_type.clone()));
        }

        let started = Instant::now();
        let mut report = ProcessReport::default();
        let mut errors = Vec::new();

        for route in routes {
            let saga_type = route.saga_type();
            match route.process(&self.repository, message, cancel).await {
                Ok(ProcessOutcome::Applied) => {
                    report.applied += 1;
                    metrics::counter!("saga_messages_processed_total", "saga_type" => saga_type)
                        .increment(1);
                }
                Ok(ProcessOutcome::AlreadyProcessed) => {
                    report.skipped += 1;
                    metrics::counter!("saga_messages_skipped_total", "saga_type" => saga_type)
                        .increment(1);
                    tracing::debug!(saga_type, "message already processed");
                }
                Err(e) => {
                    log_failure(saga_type, &e);
                    errors.push(e);
                }
            }
        }

        metrics::histogram!("saga_processing_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if errors.len() > 1 {
            return Err(SagaError::Multiple(errors));
        }
        match errors.pop() {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn log_failure(saga_type: &str, error: &SagaError) {
    if error.is_lock_conflict() {
        metrics::counter!("saga_lock_conflicts_total", "saga_type" => saga_type.to_string())
            .increment(1);
        tracing::debug!(saga_type, %error, "saga is locked by another attempt");
    } else if matches!(error, SagaError::Cancelled) {
        tracing::debug!(saga_type, "processing cancelled");
    } else {
        tracing::error!(saga_type, %error, "saga processing failed");
    }
}

/// Tracks the stage of one attempt for diagnostics.
struct Attempt {
    saga_type: &'static str,
    message_id: MessageId,
    stage: ProcessingStage,
}

impl Attempt {
    fn new(saga_type: &'static str, message_id: MessageId) -> Self {
        Self {
            saga_type,
            message_id,
            stage: ProcessingStage::Loading,
        }
    }

    fn enter(&mut self, stage: ProcessingStage) {
        tracing::trace!(
            saga_type = self.saga_type,
            message_id = %self.message_id,
            from = ?self.stage,
            to = ?stage,
            "attempt stage"
        );
        self.stage = stage;
    }

    fn finish(&mut self, result: &Result<ProcessOutcome>) {
        match result {
            Ok(_) => self.enter(ProcessingStage::Done),
            Err(e) => {
                tracing::debug!(
                    saga_type = self.saga_type,
                    message_id = %self.message_id,
                    stage = ?self.stage,
                    error = %e,
                    "attempt failed"
                );
                self.enter(ProcessingStage::Failed);
            }
        }
    }
}

/// Runs one attempt of saga `G` on `raw`, decoded as `M`.
pub(crate) async fn run_attempt<S, G, M>(
    repository: &SagaRepository<S>,
    saga: &G,
    raw: &MessageEnvelope,
    cancel: &CancellationToken,
) -> Result<ProcessOutcome>
where
    S: Persistence,
    G: Handles<M>,
    M: Message,
{
    let mut attempt = Attempt::new(G::SAGA_TYPE, raw.message_id);
    let result = load_and_advance::<S, G, M>(repository, saga, raw, cancel, &mut attempt).await;
    attempt.finish(&result);
    result
}

async fn load_and_advance<S, G, M>(
    repository: &SagaRepository<S>,
    saga: &G,
    raw: &MessageEnvelope,
    cancel: &CancellationToken,
    attempt: &mut Attempt,
) -> Result<ProcessOutcome>
where
    S: Persistence,
    G: Handles<M>,
    M: Message,
{
    if cancel.is_cancelled() {
        return Err(SagaError::Cancelled);
    }
    let message = Envelope::<M>::from_raw(raw)?;
    let (mut state, token) = repository.get_or_create::<G>(message.correlation_id).await?;

    let result = advance(repository, saga, &mut state, &token, &message, cancel, attempt).await;

    if let Err(e) = repository.release(token).await {
        tracing::warn!(saga_type = G::SAGA_TYPE, error = %e, "failed to release saga lock");
    }
    result
}

async fn advance<S, G, M>(
    repository: &SagaRepository<S>,
    saga: &G,
    state: &mut SagaState<G::Data>,
    token: &LockToken,
    message: &Envelope<M>,
    cancel: &CancellationToken,
    attempt: &mut Attempt,
) -> Result<ProcessOutcome>
where
    S: Persistence,
    G: Handles<M>,
    M: Message,
{
    attempt.enter(ProcessingStage::Checking);
    if state.was_processed(message) {
        return Ok(ProcessOutcome::AlreadyProcessed);
    }

    attempt.enter(ProcessingStage::Invoking);
    let handled = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SagaError::Cancelled),
        result = saga.handle(state, message) => result,
    };
    handled.map_err(|e| handler_failure(G::SAGA_TYPE, e))?;

    // The caller gave up while the handler ran; its effects must not land.
    if cancel.is_cancelled() {
        return Err(SagaError::Cancelled);
    }

    attempt.enter(ProcessingStage::Committing);
    state.mark_processed(message)?;

    let mut transaction = repository.store().begin().await?;
    match stage_writes::<S, G>(repository, state, token, &mut transaction).await {
        Ok(()) => transaction.commit().await?,
        Err(e) => {
            if let Err(rollback) = transaction.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            return Err(e);
        }
    }
    Ok(ProcessOutcome::Applied)
}

async fn stage_writes<S, G>(
    repository: &SagaRepository<S>,
    state: &mut SagaState<G::Data>,
    token: &LockToken,
    transaction: &mut S::Transaction,
) -> Result<()>
where
    S: Persistence,
    G: Saga,
{
    let written = state
        .flush_outbox_to(repository.store(), &mut *transaction)
        .await?;
    let version = repository
        .save::<G>(state, token, Some(transaction))
        .await?;
    tracing::trace!(written, %version, "staged saga state and outbox");
    Ok(())
}

/// Lock conflicts raised by a handler stay retryable; anything else becomes
/// a handler error.
fn handler_failure(saga_type: &'static str, error: HandlerError) -> SagaError {
    match error.downcast::<SagaError>() {
        Ok(error) if error.is_lock_conflict() => *error,
        Ok(error) => SagaError::handler(saga_type, *error),
        Err(error) => SagaError::Handler {
            saga_type,
            source: error,
        },
    }
}
