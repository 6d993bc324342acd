//! Runtime configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use saga::{OutboxCleanerOptions, OutboxDispatcherOptions};
use transport::SubscriberConfig;

/// Runtime configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_POLL_TIMEOUT_MS`: bound on one receive call (default: `250`)
/// - `SAGA_CONSUME_DELAY_MS`: pause after an empty poll (default: `250`)
/// - `SAGA_OUTBOX_INTERVAL_MS`: outbox dispatch period (default: `5000`)
/// - `SAGA_OUTBOX_BATCH_SIZE`: entries per dispatch cycle (default: `100`)
/// - `SAGA_OUTBOX_RETENTION_SECS`: how long sent entries are kept (default: 7 days)
/// - `SAGA_OUTBOX_CLEANUP_INTERVAL_SECS`: outbox cleanup period (default: `3600`)
/// - `SAGA_METRICS_ADDR`: Prometheus listener address (default: none)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
///
/// Unparsable values fall back to the default.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_timeout: Duration,
    pub consume_delay: Duration,
    pub outbox_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_retention: Duration,
    pub outbox_cleanup_interval: Duration,
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let subscriber = SubscriberConfig::default();
        let dispatcher = OutboxDispatcherOptions::default();
        let cleaner = OutboxCleanerOptions::default();
        Self {
            poll_timeout: subscriber.poll_timeout,
            consume_delay: subscriber.consume_delay,
            outbox_interval: dispatcher.interval,
            outbox_batch_size: dispatcher.batch_size,
            outbox_retention: cleaner.retention,
            outbox_cleanup_interval: cleaner.interval,
            metrics_addr: None,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let millis =
            |name: &str, default: Duration| parse(name).map_or(default, Duration::from_millis);
        let secs = |name: &str, default: Duration| parse(name).map_or(default, Duration::from_secs);
        // Loop periods must be positive.
        let period = |name: &str, default: Duration, unit: fn(u64) -> Duration| {
            parse(name).filter(|n| *n > 0).map_or(default, unit)
        };

        Self {
            poll_timeout: millis("SAGA_POLL_TIMEOUT_MS", defaults.poll_timeout),
            consume_delay: millis("SAGA_CONSUME_DELAY_MS", defaults.consume_delay),
            outbox_interval: period(
                "SAGA_OUTBOX_INTERVAL_MS",
                defaults.outbox_interval,
                Duration::from_millis,
            ),
            outbox_batch_size: parsed(&lookup, "SAGA_OUTBOX_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.outbox_batch_size),
            outbox_retention: secs("SAGA_OUTBOX_RETENTION_SECS", defaults.outbox_retention),
            outbox_cleanup_interval: period(
                "SAGA_OUTBOX_CLEANUP_INTERVAL_SECS",
                defaults.outbox_cleanup_interval,
                Duration::from_secs,
            ),
            metrics_addr: parsed(&lookup, "SAGA_METRICS_ADDR"),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            poll_timeout: self.poll_timeout,
            consume_delay: self.consume_delay,
            ..SubscriberConfig::default()
        }
    }

    pub fn dispatcher_options(&self) -> OutboxDispatcherOptions {
        OutboxDispatcherOptions {
            interval: self.outbox_interval,
            batch_size: self.outbox_batch_size,
        }
    }

    pub fn cleaner_options(&self) -> OutboxCleanerOptions {
        OutboxCleanerOptions {
            interval: self.outbox_cleanup_interval,
            retention: self.outbox_retention,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}
