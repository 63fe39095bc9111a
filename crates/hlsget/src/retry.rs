// Shared retry-with-backoff loop for segment fetching.
//
// Backoff grows linearly with the attempt number and is capped, so a flaky
// origin is given a short breather without stalling the whole job.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the initial try included.
    pub max_attempts: u32,
    /// Delay after attempt `n` (1-based) is `base_delay * n`, capped below.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay slept after a failed attempt (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(attempt)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Result of a single attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Failed, but another attempt may succeed (transport, status, empty body).
    Retry(DownloadError),
    /// Failed permanently; no further attempts (cancellation).
    Fail(DownloadError),
}

/// Run `operation` until it succeeds, permanently fails, or attempts run out.
///
/// The closure receives the 1-based attempt number. The cancellation token is
/// checked before every attempt and raced against every backoff sleep, so a
/// pause or cancel never waits out a backoff.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= attempts {
                    return Err(err);
                }
                let delay = policy.delay_after_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(DownloadError::Internal {
        reason: "retry loop exited without a result".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_ramps_linearly_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(7), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&quick_policy(3), &token, |_| async {
            RetryAction::Success(7u32)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_then_surfaces_last_error() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&quick_policy(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(DownloadError::segment_fetch("HTTP 500")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_a_later_attempt() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(&quick_policy(3), &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 3 {
                    RetryAction::Retry(DownloadError::segment_fetch("HTTP 502"))
                } else {
                    RetryAction::Success("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&quick_policy(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Fail(DownloadError::Cancelled) }
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> = retry_with_backoff(&quick_policy(3), &token, |_| async {
            RetryAction::Success(1u32)
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
