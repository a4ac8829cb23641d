//! Bounded retries with backoff for post-commit side effects.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use marketplace_observability::SyncMetrics;

use crate::error::SyncError;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries, in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay cap, in milliseconds
    pub max_delay_ms: u64,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_delay_ms: ms,
            max_delay_ms: ms,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed), jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.base_delay_for_attempt(attempt);
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    fn base_delay_for_attempt(&self, attempt: u32) -> f64 {
        let base_ms = self.base_delay_ms as f64;
        let max_ms = self.max_delay_ms as f64;

        match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        }
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Every attempt failed.
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub attempts: u32,
    pub last_error: SyncError,
}

/// Run `op` until it succeeds or `policy` gives up. Each attempt is bounded by
/// `per_call`; a timed-out attempt counts as a failure.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    per_call: Duration,
    label: &str,
    metrics: &SyncMetrics,
    mut op: F,
) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut retries = 0;
    loop {
        let outcome = match tokio::time::timeout(per_call, op()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(per_call)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(retries) => {
                retries += 1;
                metrics.side_effect_retried(label);
                let delay = policy.delay_for_attempt(retries);
                warn!(
                    side_effect = label,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "side effect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(Exhausted {
                    attempts: retries + 1,
                    last_error: err,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::cache::CacheError;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::fixed(3, Duration::from_millis(100))
        };
        for _ in 0..100 {
            let d = policy.delay_for_attempt(1).as_millis();
            assert!((50..=150).contains(&d), "delay {d} out of band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let metrics = SyncMetrics::new();
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        let result = retry_with_backoff(&policy, Duration::from_secs(1), "test", &metrics, || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SyncError::Cache(CacheError::Unavailable("down".into())))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().side_effect_retries, 2);
        assert_eq!(metrics.side_effects("test", "retried"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_times_out_slow_calls() {
        let metrics = SyncMetrics::new();
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));

        let result: Result<(), Exhausted> =
            retry_with_backoff(&policy, Duration::from_millis(50), "slow", &metrics, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert!(matches!(exhausted.last_error, SyncError::Timeout(_)));
    }
}
