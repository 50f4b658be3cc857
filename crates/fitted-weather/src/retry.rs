//! Retry utilities for upstream fetches with exponential backoff.
//!
//! Only `Transient` failures (429, 5xx, timeouts, connection resets) are
//! retried. Invalid requests and malformed bodies fail immediately.

use std::future::Future;
use std::time::Duration;

use fitted_core::{FetchError, RetrySettings};
use tokio::time::Instant;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries (doubles each attempt)
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            settings.initial_delay_ms,
            settings.max_delay_ms,
        )
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Calculate the delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Exponential backoff: initial_delay * 2^attempt
        let factor = 2u64.saturating_pow(attempt);
        let delay_ms = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

impl RetryDecision {
    pub fn for_error(error: &FetchError) -> Self {
        match error {
            FetchError::Transient { .. } => RetryDecision::Retry,
            FetchError::InvalidRequest(_)
            | FetchError::MalformedUpstreamData(_)
            | FetchError::DeadlineExceeded(_) => RetryDecision::NoRetry,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out.
///
/// When `deadline` is set, a backoff sleep that would end past it is skipped
/// and the last error is returned instead. The closure receives the attempt
/// number and the time left before the deadline.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    deadline: Option<Instant>,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32, Option<Duration>) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let error = match operation(attempt, remaining).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Upstream request succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if RetryDecision::for_error(&error) == RetryDecision::NoRetry {
            tracing::debug!(error = %error, "Non-retryable upstream error");
            return Err(error);
        }
        if attempt >= config.max_retries {
            tracing::warn!(
                attempts = attempt + 1,
                error = %error,
                "All upstream retry attempts exhausted"
            );
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        if let Some(deadline) = deadline {
            if Instant::now() + delay >= deadline {
                tracing::warn!(error = %error, "No time left for another upstream attempt");
                return Err(error);
            }
        }

        tracing::warn!(
            attempt = attempt + 1,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retryable upstream error, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(3, 100, 5000);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new(10, 100, 1000);

        // With 100ms initial and max 1000ms, 2^4 * 100 = 1600 > 1000
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(63), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_decisions() {
        assert_eq!(
            RetryDecision::for_error(&FetchError::transient(Some(503), "down")),
            RetryDecision::Retry
        );
        assert_eq!(
            RetryDecision::for_error(&FetchError::InvalidRequest("no".into())),
            RetryDecision::NoRetry
        );
        assert_eq!(
            RetryDecision::for_error(&FetchError::MalformedUpstreamData("bad".into())),
            RetryDecision::NoRetry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryConfig::new(2, 10, 100), None, |_, _| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FetchError::transient(Some(503), "down"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::new(5, 10, 100), None, |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::InvalidRequest("unknown location".into())) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::InvalidRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::new(2, 10, 100), None, |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::transient(Some(429), "slow down")) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Transient { status: Some(429), .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_backoff() {
        let calls = AtomicU32::new(0);
        let deadline = Instant::now() + Duration::from_millis(50);
        let result: Result<(), _> =
            with_retry(&RetryConfig::new(5, 100, 1000), Some(deadline), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::transient(Some(503), "down")) }
            })
            .await;
        assert!(result.is_err());
        // The first backoff (100ms) would overrun the 50ms deadline
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
