use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, MessageId};

/// Version number of a saga record, used for optimistic concurrency control.
///
/// A record that was never saved is at version 0; every successful save
/// increments it by 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of a saga that was never saved.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A message in its storage and transport form.
///
/// The payload is kept as JSON so stores and transports never need to know
/// the concrete message type; `message_type` is the logical name used to
/// resolve it back into a typed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier for this message.
    pub message_id: MessageId,

    /// The logical type of the message (e.g., "PlaceOrder").
    pub message_type: String,

    /// The saga instance this message is addressed to.
    pub correlation_id: CorrelationId,

    /// When the message was created.
    pub timestamp: DateTime<Utc>,

    /// The message body as JSON.
    pub payload: serde_json::Value,

    /// Free-form headers carried alongside the message.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl MessageEnvelope {
    /// Creates a new message envelope builder.
    pub fn builder() -> MessageEnvelopeBuilder {
        MessageEnvelopeBuilder::default()
    }
}

/// Builder for constructing message envelopes.
#[derive(Debug, Default)]
pub struct MessageEnvelopeBuilder {
    message_id: Option<MessageId>,
    message_type: Option<String>,
    correlation_id: Option<CorrelationId>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    headers: HashMap<String, String>,
}

impl MessageEnvelopeBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Sets the logical message type.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a header entry.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds the message envelope.
    ///
    /// # Panics
    ///
    /// Panics if required fields (message_type, correlation_id, payload) are not set.
    pub fn build(self) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self.message_id.unwrap_or_default(),
            message_type: self.message_type.expect("message_type is required"),
            correlation_id: self.correlation_id.expect("correlation_id is required"),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.expect("payload is required"),
            headers: self.headers,
        }
    }

    /// Tries to build the message envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<MessageEnvelope> {
        Some(MessageEnvelope {
            message_id: self.message_id.unwrap_or_default(),
            message_type: self.message_type?,
            correlation_id: self.correlation_id?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload?,
            headers: self.headers,
        })
    }
}
