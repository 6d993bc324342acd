//! Decoding of inbound transport messages.

use std::collections::HashSet;
use std::sync::Arc;

use saga::HandlerRegistry;
use saga_store::{MessageEnvelope, Persistence};

use crate::error::{Result, TransportError};
use crate::message::TransportMessage;

/// Tells whether a logical message type name can be handled.
pub trait TypeResolver: Send + Sync {
    fn is_known(&self, message_type: &str) -> bool;
}

impl<S: Persistence + 'static> TypeResolver for HandlerRegistry<S> {
    fn is_known(&self, message_type: &str) -> bool {
        self.contains(message_type)
    }
}

impl TypeResolver for HashSet<String> {
    fn is_known(&self, message_type: &str) -> bool {
        self.contains(message_type)
    }
}

impl<R: TypeResolver + ?Sized> TypeResolver for Arc<R> {
    fn is_known(&self, message_type: &str) -> bool {
        (**self).is_known(message_type)
    }
}

/// Turns a [`TransportMessage`] into a [`MessageEnvelope`].
///
/// The type header must be present, valid UTF-8 and known to the resolver;
/// the body must decode, and the decoded envelope must carry the same type as
/// the header.
#[derive(Clone)]
pub struct MessageParser {
    resolver: Arc<dyn TypeResolver>,
}

impl MessageParser {
    pub fn new(resolver: Arc<dyn TypeResolver>) -> Self {
        Self { resolver }
    }

    pub fn parse(&self, message: &TransportMessage) -> Result<MessageEnvelope> {
        let message_type = message.message_type()?;
        if !self.resolver.is_known(&message_type) {
            return Err(TransportError::UnknownMessageType(message_type));
        }

        let envelope: MessageEnvelope = serde_json::from_slice(&message.body)?;
        if envelope.message_type != message_type {
            return Err(TransportError::TypeMismatch {
                header: message_type,
                body: envelope.message_type,
            });
        }
        Ok(envelope)
    }
}
