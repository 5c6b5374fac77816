//! Exponential backoff for metadata requests.
//!
//! File transfers are never retried here: a failed file stays failed until
//! the user syncs again.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// What the caller wants done with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// `min(base * 2^retry, max)` plus up to one `base` of random jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter_ms = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        backoff + Duration::from_millis(jitter_ms)
    }
}

/// Run `operation` until it succeeds, `classifier` aborts, or retries run out.
/// The last error is returned on failure.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if retry >= config.max_retries || classifier(&err) == RetryAction::Abort {
            return Err(err);
        }

        let delay = config.delay_for_retry(retry);
        retry += 1;
        tracing::warn!(
            attempt = retry,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Request failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn instant(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        for (retry, floor) in [(0, 100), (1, 200), (2, 400)] {
            let d = config.delay_for_retry(retry).as_millis() as u64;
            assert!(d >= floor && d < floor + 100, "retry {retry}: {d}ms");
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig {
            max_retries: 40,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
        };
        let d = config.delay_for_retry(40).as_millis() as u64;
        assert!((300..350).contains(&d));
    }

    #[test]
    fn test_zero_base_has_no_jitter() {
        assert_eq!(instant(1).delay_for_retry(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_first_success_is_returned() {
        let result: Result<u8, String> =
            retry_with_backoff(&instant(3), |_| RetryAction::Retry, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_abort_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u8, String> = retry_with_backoff(
            &instant(3),
            |_| RetryAction::Abort,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden".to_string())
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "forbidden");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u8, String> = retry_with_backoff(
            &instant(2),
            |_| RetryAction::Retry,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("502".to_string())
                    } else {
                        Ok(1)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u8, String> = retry_with_backoff(
            &instant(2),
            |_| RetryAction::Retry,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("timeout".to_string())
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
