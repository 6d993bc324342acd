use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use saga_store::OutboxStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::tick_period;
use crate::error::Result;

/// Cleaner configuration.
#[derive(Debug, Clone)]
pub struct OutboxCleanerOptions {
    /// Time between cleanup cycles.
    pub interval: Duration,
    /// How long sent entries are kept.
    pub retention: Duration,
}

impl Default for OutboxCleanerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Deletes sent outbox entries once they are older than the retention window.
/// Unsent entries are never touched.
pub struct OutboxCleaner<O> {
    outbox: O,
    options: OutboxCleanerOptions,
}

impl<O: OutboxStore + 'static> OutboxCleaner<O> {
    pub fn new(outbox: O, options: OutboxCleanerOptions) -> Self {
        Self { outbox, options }
    }

    pub fn options(&self) -> &OutboxCleanerOptions {
        &self.options
    }

    /// Entries sent before this instant are eligible for deletion.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = TimeDelta::from_std(self.options.retention).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Runs a single cycle and returns how many entries were deleted.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_once(&self) -> Result<usize> {
        let cutoff = self.cutoff(Utc::now());
        let deleted = self.outbox.delete_sent_before(cutoff).await?;

        if deleted > 0 {
            metrics::counter!("outbox_messages_cleaned_total").increment(deleted as u64);
            tracing::info!(deleted, %cutoff, "cleaned sent outbox entries");
        }
        Ok(deleted)
    }

    /// Spawns the cleanup loop. Failures are logged and retried next cycle.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval = ?self.options.interval,
                retention = ?self.options.retention,
                "outbox cleaner started"
            );
            let mut ticker = tokio::time::interval(tick_period(self.options.interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.cleanup_once().await {
                            tracing::error!(error = %e, "outbox cleanup failed");
                        }
                    }
                }
            }
            tracing::info!("outbox cleaner stopped");
        })
    }
}
