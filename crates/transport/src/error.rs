//! Transport error types.

use saga::SagaError;
use thiserror::Error;

use crate::consumer::DeliveryId;

/// Errors raised while moving or decoding transport messages.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Message type header is missing")]
    MissingTypeHeader,

    #[error("Message type header is not valid UTF-8")]
    InvalidTypeHeader(#[source] std::string::FromUtf8Error),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Cannot decode message body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message has the wrong type: header says '{header}', body says '{body}'")]
    TypeMismatch { header: String, body: String },

    /// The broker cannot serve the request right now (e.g., the topic does
    /// not exist yet).
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(DeliveryId),

    #[error("Subscriber already started")]
    AlreadyStarted,

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }

    /// Returns true if the message itself can never be processed.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            TransportError::MissingTypeHeader
                | TransportError::InvalidTypeHeader(_)
                | TransportError::UnknownMessageType(_)
                | TransportError::Decode(_)
                | TransportError::TypeMismatch { .. }
        )
    }
}

impl From<TransportError> for SagaError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::UnknownMessageType(message_type) => {
                SagaError::TypeResolution(message_type)
            }
            err if err.is_poison() => SagaError::Decode(err.to_string()),
            err => SagaError::TransportTransient(err.to_string()),
        }
    }
}

/// Convenience type alias for transport results.
pub type Result<T> = std::result::Result<T, TransportError>;
