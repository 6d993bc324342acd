//! Host error types.

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use transport::TransportError;

/// Errors raised while wiring or starting the runtime.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to start subscriber: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to install metrics exporter: {0}")]
    Metrics(#[from] BuildError),
}
