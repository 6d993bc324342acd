//! Identifier types shared by every crate of the saga runtime.

pub mod types;

pub use types::{CorrelationId, MessageId};
