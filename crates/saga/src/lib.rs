//! Saga orchestration core.
//!
//! Sagas are long-running workflows advanced by correlated messages. This
//! crate provides the pieces that make each step safe to retry:
//!
//! - [`SagaState`] tracks which messages were applied and buffers the
//!   messages a step emits
//! - [`SagaRepository`] loads and saves state under an exclusive lock
//! - [`MessageProcessor`] runs a message through every saga that handles it
//!   and commits state and outbox together
//! - [`MessageBus`] records outbound messages in the outbox
//! - [`OutboxDispatcher`] and [`OutboxCleaner`] drain and prune the outbox
//!   in the background

pub mod bus;
pub mod error;
pub mod handler;
pub mod message;
pub mod outbox;
pub mod processor;
pub mod registry;
pub mod repository;
pub mod state;

pub use bus::MessageBus;
pub use error::{ErrorKind, Result, SagaError};
pub use handler::{HandlerError, Handles, Saga};
pub use message::{Correlated, Envelope, Message};
pub use outbox::{
    DispatchReport, MessagePublisher, OutboxCleaner, OutboxCleanerOptions, OutboxDispatcher,
    OutboxDispatcherOptions,
};
pub use processor::{MessageProcessor, ProcessOutcome, ProcessReport, ProcessingStage, Processor};
pub use registry::HandlerRegistry;
pub use repository::SagaRepository;
pub use state::SagaState;
