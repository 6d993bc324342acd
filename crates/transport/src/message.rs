//! The wire shape exchanged with a broker.

use std::collections::HashMap;

use saga_store::MessageEnvelope;

use crate::error::{Result, TransportError};

/// Header carrying the logical message type name, as UTF-8 bytes.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

/// Opaque body bytes plus byte-valued headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    pub headers: HashMap<String, Vec<u8>>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: HashMap::new(),
            body,
        }
    }

    /// Encodes an envelope as a JSON body and sets the type header.
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self> {
        let body = serde_json::to_vec(envelope)?;
        Ok(Self::new(body).with_header(MESSAGE_TYPE_HEADER, envelope.message_type.as_bytes()))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Reads the message type header.
    pub fn message_type(&self) -> Result<String> {
        let bytes = self
            .headers
            .get(MESSAGE_TYPE_HEADER)
            .ok_or(TransportError::MissingTypeHeader)?;
        String::from_utf8(bytes.clone()).map_err(TransportError::InvalidTypeHeader)
    }
}
