use std::time::Duration;

/// Timing and retry policy of a [`crate::Subscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Upper bound on a single receive call.
    pub poll_timeout: Duration,
    /// Pause between polls that returned nothing.
    pub consume_delay: Duration,
    /// Delay before the first redelivery of a retryable message.
    pub retry_backoff: Duration,
    /// Cap on the redelivery delay, which doubles with every attempt.
    pub max_retry_backoff: Duration,
    /// Pause after the transport reported itself unavailable.
    pub transient_backoff: Duration,
    /// Deliveries allowed for a message failing with persistence errors
    /// before it is dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(250),
            consume_delay: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_secs(5),
            transient_backoff: Duration::from_secs(1),
            max_redeliveries: 5,
        }
    }
}

impl SubscriberConfig {
    /// Redelivery delay after the given delivery attempt (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_retry_backoff)
    }
}
