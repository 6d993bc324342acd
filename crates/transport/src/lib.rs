//! Transport-side plumbing for saga messages.
//!
//! A transport moves [`TransportMessage`]s: opaque bytes plus a mandatory
//! `message-type` header. [`MessageParser`] turns them back into envelopes,
//! and a [`Subscriber`] drives the consume loop for one message type, calling
//! the saga processor and applying the retry/requeue protocol:
//!
//! - success acknowledges the delivery
//! - a lock conflict, even inside an aggregate error, requeues it with backoff
//! - poison messages and handler failures go to the dead-letter path
//! - transient transport errors back off and retry the consume call
//!
//! [`InMemoryBroker`] is a complete in-process transport used by tests and by
//! single-process deployments.

pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod parser;
pub mod subscriber;

pub use config::SubscriberConfig;
pub use consumer::{Consumer, Delivery, DeliveryId};
pub use error::{Result, TransportError};
pub use memory::{DeadLetter, InMemoryBroker, InMemoryConsumer};
pub use message::{MESSAGE_TYPE_HEADER, TransportMessage};
pub use parser::{MessageParser, TypeResolver};
pub use subscriber::{Subscriber, SubscriberState};
