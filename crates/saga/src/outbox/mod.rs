//! Background loops that drain and garbage-collect the outbox.
//!
//! - [`OutboxDispatcher`] publishes unsent entries to a transport and marks
//!   them sent once the transport accepts them
//! - [`OutboxCleaner`] deletes sent entries older than a retention window

use std::time::Duration;

mod cleaner;
mod dispatcher;

pub use cleaner::{OutboxCleaner, OutboxCleanerOptions};
pub use dispatcher::{DispatchReport, MessagePublisher, OutboxDispatcher, OutboxDispatcherOptions};

/// Bounds on the period either loop ticks at. `tokio::time::interval` panics
/// on a zero period, and a period near `Duration::MAX` overflows `Instant`.
const MIN_TICK: Duration = Duration::from_millis(1);
const MAX_TICK: Duration = Duration::from_secs(365 * 24 * 3600);

fn tick_period(interval: Duration) -> Duration {
    interval.clamp(MIN_TICK, MAX_TICK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_is_clamped() {
        assert_eq!(tick_period(Duration::ZERO), MIN_TICK);
        assert_eq!(tick_period(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(tick_period(Duration::MAX), MAX_TICK);
    }
}
