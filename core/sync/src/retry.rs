//! Retry policy for failed items and transient persistence errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use offsync_common::{Error, Result};

/// When a failed item becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Retry on the next drain pass; the retry delay is the periodic interval.
    #[default]
    NextPass,
    /// Gate each retry with an exponentially growing delay.
    Backoff,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// How failed items are rescheduled.
    pub mode: RetryMode,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(mode: RetryMode) -> Self {
        Self {
            mode,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Earliest time an item that has failed `retry_count` times may run again.
    ///
    /// `None` means "on the next pass".
    pub fn next_attempt_at(&self, retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.mode {
            RetryMode::NextPass => None,
            RetryMode::Backoff => {
                let delay = self.delay_for_attempt(retry_count.saturating_sub(1));
                let at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay));
                Some(at.unwrap_or(DateTime::<Utc>::MAX_UTC))
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(RetryMode::default())
    }
}

/// Repeats a durable write while it fails with a transient error.
///
/// Used for the end-of-pass write-back, not for item processing: items are
/// retried across passes, never in place.
pub struct RetryExecutor {
    config: RetryConfig,
    max_retries: u32,
}

impl RetryExecutor {
    /// Allow up to `max_retries` extra attempts, spaced by `config`.
    pub fn new(config: RetryConfig, max_retries: u32) -> Self {
        Self {
            config,
            max_retries,
        }
    }

    /// Run `write` until it succeeds, fails permanently, or runs out of
    /// attempts. The last error is returned.
    pub async fn execute<F, Fut, T>(&self, write: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match write().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Write succeeded after {} retries", retries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_transient(&err) || retries >= self.max_retries {
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            warn!("Write failed ({}); retry {} of {} in {:?}", err, retries, self.max_retries, delay);
            sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Errors worth another attempt: the backend may recover.
fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Storage(_) | Error::Persistence(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(initial: Duration) -> RetryConfig {
        RetryConfig::new(RetryMode::Backoff)
            .with_initial_delay(initial)
            .with_jitter(false)
    }

    /// Write that fails `failures` times with `err`, then succeeds.
    async fn flaky_write(calls: &AtomicU32, failures: u32, err: fn() -> Error) -> Result<u32> {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        if call < failures {
            Err(err())
        } else {
            Ok(call)
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let config = no_jitter(Duration::from_millis(500)).with_max_delay(Duration::from_secs(3));

        let delays: Vec<Duration> = (0..5).map(|n| config.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new(RetryMode::Backoff).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750) && delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_next_attempt_at_by_mode() {
        let now = Utc::now();
        assert_eq!(RetryConfig::default().next_attempt_at(1, now), None);

        let backoff = no_jitter(Duration::from_secs(2));
        assert_eq!(backoff.next_attempt_at(1, now), Some(now + chrono::Duration::seconds(2)));
        assert_eq!(backoff.next_attempt_at(2, now), Some(now + chrono::Duration::seconds(4)));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(no_jitter(Duration::from_millis(1)), 3);

        let result = executor
            .execute(|| flaky_write(&calls, 2, || Error::Persistence("disk busy".to_string())))
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(no_jitter(Duration::from_millis(1)), 3);

        let result = executor
            .execute(|| flaky_write(&calls, 5, || Error::Serialization("bad data".to_string())))
            .await;

        assert!(matches!(result, Err(Error::Serialization(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(no_jitter(Duration::from_millis(1)), 2);

        let result = executor
            .execute(|| flaky_write(&calls, 10, || Error::Storage("offline disk".to_string())))
            .await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
