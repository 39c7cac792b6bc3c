use common::config::RetryConfig;
use std::time::Duration;

/// Node retry policy: bounded attempts with exponential back-off, gated on
/// the error message containing one of the retryable markers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A failure is retried only while attempts remain and the message
    /// carries a retryable marker.
    pub fn is_retryable(&self, message: &str, retry_count: u32) -> bool {
        retry_count < self.config.max_retries
            && self
                .config
                .retryable_errors
                .iter()
                .any(|marker| message.contains(marker))
    }

    /// Delay before re-running attempt `retry_count` (0-indexed), capped at
    /// the configured maximum.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let delay_ms = self.config.retry_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry_count as i32);
        Duration::from_millis((delay_ms as u64).min(self.config.max_retry_delay_ms))
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(2), Duration::from_millis(4000));
        // Far past the cap.
        assert_eq!(policy.delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn retryable_requires_marker_and_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable("TIMEOUT connecting to host", 0));
        assert!(policy.is_retryable("upstream RATE_LIMIT hit", 2));
        // Budget exhausted.
        assert!(!policy.is_retryable("TIMEOUT connecting to host", 3));
        // Not a retryable failure.
        assert!(!policy.is_retryable("invalid credentials", 0));
    }

    #[test]
    fn custom_markers_are_honored() {
        let policy = RetryPolicy::new(RetryConfig {
            retryable_errors: vec!["EAGAIN".to_string()],
            ..RetryConfig::default()
        });
        assert!(policy.is_retryable("socket EAGAIN", 0));
        assert!(!policy.is_retryable("TIMEOUT", 0));
    }
}
