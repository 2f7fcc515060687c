//! Retry policy for calls to external collaborators
//!
//! Exponential backoff with jitter. Only errors reporting
//! [`RelayerError::is_retryable`] are retried; everything else is returned to
//! the caller on the first failure.

use crate::config::RetryConfig;
use crate::error::{RelayerError, RelayerResult};

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fraction of the delay randomly added or removed
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0 = first retry)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        if base_ms == 0 || max_ms == 0 {
            return Duration::ZERO;
        }

        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        let jitter_range = (delay_ms as f64 * JITTER_FRACTION).floor() as u64;
        if jitter_range == 0 {
            return Duration::from_millis(delay_ms);
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=jitter_range);
        let delay_ms = if rng.gen_bool(0.5) {
            delay_ms.saturating_add(jitter)
        } else {
            delay_ms.saturating_sub(jitter)
        };
        Duration::from_millis(delay_ms)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        "Retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Bound `fut` by `timeout`, failing with a timeout error for `operation`
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: &str, fut: Fut) -> RelayerResult<T>
where
    Fut: Future<Output = RelayerResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RelayerError::Timeout {
            operation: operation.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delays_grow_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };

        for (attempt, nominal) in [(0u32, 100u64), (1, 200), (2, 400), (3, 800), (4, 1_000), (30, 1_000)] {
            for _ in 0..20 {
                let delay = policy.delay_for(attempt).as_millis() as u64;
                let spread = (nominal as f64 * JITTER_FRACTION) as u64;
                assert!(
                    delay >= nominal - spread && delay <= nominal + spread,
                    "attempt {} gave {}ms",
                    attempt,
                    delay
                );
            }
        }
        assert_eq!(RetryPolicy::none().delay_for(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy(3)
            .run("fetch", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RelayerError::AttestationUnreachable("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: RelayerResult<()> = fast_policy(2)
            .run("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayerError::Timeout {
                    operation: "fetch".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(RelayerError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_non_retryable() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: RelayerResult<()> = fast_policy(5)
            .run("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayerError::AttestationPending {
                    chain_id: 5,
                    sequence: 1,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let result: RelayerResult<()> = with_timeout(Duration::from_millis(5), "slow", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RelayerError::Timeout { operation }) if operation == "slow"));
    }
}
