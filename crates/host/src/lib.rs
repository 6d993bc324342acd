//! Runtime host for the saga orchestration system.
//!
//! Wires a store, a handler registry and a transport into a running
//! [`Runtime`], with configuration from the environment and Prometheus
//! metrics.

pub mod config;
pub mod demo;
pub mod error;
pub mod runtime;

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub use config::RuntimeConfig;
pub use error::HostError;
pub use runtime::Runtime;

/// Installs the Prometheus recorder, serving `/metrics` on `addr` when given.
pub fn install_metrics(addr: Option<SocketAddr>) -> Result<(), HostError> {
    let builder = PrometheusBuilder::new();
    match addr {
        Some(addr) => {
            builder.with_http_listener(addr).install()?;
            tracing::info!(%addr, "serving Prometheus metrics");
        }
        None => {
            builder.install_recorder()?;
        }
    }
    Ok(())
}
