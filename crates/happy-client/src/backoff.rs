//! Exponential-backoff retry driver (§4.9).
//!
//! Grounded on the reconnect-policy shape used for socket reconnection
//! elsewhere in this codebase, scaled down to the smaller base delay and
//! attempt budget the optimistic-concurrency updater (C5) needs.

use std::time::Duration;

use rand::RngExt;

/// `BackoffPolicy::default()` matches §4.9: ~100ms base, x2, capped at a
/// few seconds, ~6 attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Jitter added as a fraction of the computed delay, e.g. `0.2` = ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 6,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let jitter_span = capped_ms * self.jitter;
        let jittered_ms = if jitter_span > 0.0 {
            let offset = rand::rng().random_range(-jitter_span..=jitter_span);
            (capped_ms + offset).max(0.0)
        } else {
            capped_ms
        };
        Duration::from_millis(jittered_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Error returned when a retried operation never succeeds within the budget.
#[derive(Debug, thiserror::Error)]
#[error("attempts exhausted after {attempts} tries")]
pub struct AttemptsExhausted {
    pub attempts: u32,
}

/// Retry `body` under `policy`. `body` returning `Ok` exits immediately;
/// `Err` is the only retry signal. Sleeps between attempts use `tokio::time`.
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, mut body: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match body(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_spec_ranges() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 6);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        // Keeps doubling until the 5s cap.
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[tokio::test]
    async fn retry_succeeds_without_retrying_on_first_ok() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        let mut calls = 0;
        let result: Result<i32, &str> = retry(&policy, |_attempt| {
            calls += 1;
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_exhausts_after_max_attempts() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        let mut calls = 0;
        let result: Result<i32, &str> = retry(&policy, |_attempt| {
            calls += 1;
            async { Err("boom") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 4); // initial try + 3 retries
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        let result: Result<i32, &str> = retry(&policy, |attempt| async move {
            if attempt < 2 {
                Err("not yet")
            } else {
                Ok(99)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
    }
}
