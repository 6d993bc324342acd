//! Typed messages and their conversion to the storage/transport form.

use chrono::{DateTime, Utc};
use saga_store::{CorrelationId, MessageEnvelope, MessageId};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, SagaError};

/// A message body exchanged between sagas.
///
/// `MESSAGE_TYPE` is the logical name written to the transport's type header
/// and used to resolve handlers, so it must be unique across the system.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Anything that carries a message ID and a correlation ID.
pub trait Correlated {
    fn message_id(&self) -> MessageId;
    fn correlation_id(&self) -> CorrelationId;
}

impl Correlated for MessageEnvelope {
    fn message_id(&self) -> MessageId {
        self.message_id
    }

    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

/// A typed message together with its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    pub body: M,
}

impl<M: Message> Envelope<M> {
    /// Wraps a body addressed to the saga identified by `correlation_id`.
    pub fn new(correlation_id: CorrelationId, body: M) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id,
            timestamp: Utc::now(),
            body,
        }
    }

    /// Overrides the generated message ID.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Returns the logical message type.
    pub fn message_type(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    /// Converts into the untyped envelope used by stores and transports.
    pub fn to_raw(&self) -> Result<MessageEnvelope> {
        let payload = serde_json::to_value(&self.body)
            .map_err(|e| SagaError::Decode(format!("cannot encode {}: {e}", M::MESSAGE_TYPE)))?;

        Ok(MessageEnvelope::builder()
            .message_id(self.id)
            .message_type(M::MESSAGE_TYPE)
            .correlation_id(self.correlation_id)
            .timestamp(self.timestamp)
            .payload_raw(payload)
            .build())
    }

    /// Decodes an untyped envelope, checking that its type matches `M`.
    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self> {
        if raw.message_type != M::MESSAGE_TYPE {
            return Err(SagaError::Decode(format!(
                "expected message type {}, got {}",
                M::MESSAGE_TYPE,
                raw.message_type
            )));
        }

        let body = M::deserialize(&raw.payload)
            .map_err(|e| SagaError::Decode(format!("invalid {} payload: {e}", M::MESSAGE_TYPE)))?;

        Ok(Self {
            id: raw.message_id,
            correlation_id: raw.correlation_id,
            timestamp: raw.timestamp,
            body,
        })
    }
}

impl<M> Correlated for Envelope<M> {
    fn message_id(&self) -> MessageId {
        self.id
    }

    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}
