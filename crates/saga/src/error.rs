//! Saga error types.

use saga_store::StoreError;
use thiserror::Error;

/// Stable discriminator of a [`SagaError`], independent of how it was wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LockConflict,
    InvariantViolation,
    Handler,
    Persistence,
    Decode,
    TypeResolution,
    TransportTransient,
    Cancelled,
    Multiple,
}

/// Errors that can occur while processing saga messages.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Another attempt owns the saga instance, or the lock token went stale.
    #[error("Lock conflict: {0}")]
    LockConflict(#[source] StoreError),

    /// A programmer contract was broken (e.g., mismatched correlation ID).
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The saga's handler failed.
    #[error("Handler for saga '{saga_type}' failed: {source}")]
    Handler {
        saga_type: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Storage failure unrelated to concurrency.
    #[error("Persistence error: {0}")]
    Persistence(#[source] StoreError),

    /// The message payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No handler or type is known for this message type.
    #[error("Unknown message type: {0}")]
    TypeResolution(String),

    /// The transport is temporarily unavailable.
    #[error("Transport unavailable: {0}")]
    TransportTransient(String),

    /// Processing was cancelled before it could commit.
    #[error("Processing cancelled")]
    Cancelled,

    /// Several sagas handled the message and more than one failed.
    #[error("{} saga(s) failed: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<SagaError>),
}

fn join_messages(errors: &[SagaError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SagaError {
    /// Wraps an arbitrary handler failure.
    pub fn handler(
        saga_type: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        SagaError::Handler {
            saga_type,
            source: source.into(),
        }
    }

    /// Returns the kind of this error, without looking inside wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::LockConflict(_) => ErrorKind::LockConflict,
            SagaError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            SagaError::Handler { .. } => ErrorKind::Handler,
            SagaError::Persistence(_) => ErrorKind::Persistence,
            SagaError::Decode(_) => ErrorKind::Decode,
            SagaError::TypeResolution(_) => ErrorKind::TypeResolution,
            SagaError::TransportTransient(_) => ErrorKind::TransportTransient,
            SagaError::Cancelled => ErrorKind::Cancelled,
            SagaError::Multiple(_) => ErrorKind::Multiple,
        }
    }

    /// Returns true if this error, or any error it wraps, is of `kind`.
    ///
    /// Looks through [`SagaError::Multiple`] members and through the
    /// `source()` chain, downcasting each link.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        if self.kind() == kind {
            return true;
        }
        if let SagaError::Multiple(errors) = self {
            return errors.iter().any(|e| e.has_kind(kind));
        }

        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if let Some(saga_err) = err.downcast_ref::<SagaError>() {
                return saga_err.has_kind(kind);
            }
            if kind == ErrorKind::LockConflict
                && err
                    .downcast_ref::<StoreError>()
                    .is_some_and(StoreError::is_lock_conflict)
            {
                return true;
            }
            source = err.source();
        }
        false
    }

    /// Returns true if this error is, transitively, a lock conflict.
    pub fn is_lock_conflict(&self) -> bool {
        self.has_kind(ErrorKind::LockConflict)
    }

    /// Returns true if the caller should retry the same message later.
    pub fn is_retryable(&self) -> bool {
        self.is_lock_conflict()
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        if err.is_lock_conflict() {
            SagaError::LockConflict(err)
        } else {
            SagaError::Persistence(err)
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
