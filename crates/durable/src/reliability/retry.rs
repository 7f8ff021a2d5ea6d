//! Retry policy implementation

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration for retrying store writes
///
/// Supports exponential backoff with jitter so that workers hitting the same
/// database hiccup do not retry in lockstep.
///
/// # Example
///
/// ```
/// use repocrawl_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(50))
///     .with_max_interval(Duration::from_secs(1));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means +/-10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy sized for short store writes
    ///
    /// - 3 max attempts
    /// - 100 millisecond initial interval
    /// - 2 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    ///
    /// Returns the duration to wait before that attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or attempts run out
    ///
    /// Returns the last error when every attempt failed.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    warn!(operation = what, attempt, error = %e, ?delay, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::exponential()
            .with_jitter(0.0)
            .with_max_attempts(10);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1000), 5).with_jitter(0.1);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(3);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_serde_uses_millis() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250), 2);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 250);

        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::exponential();

        let result: Result<u32, String> = policy
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 2);

        let result: Result<(), String> = policy
            .run("broken", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_runs_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), &str> = RetryPolicy::no_retry()
            .run("once", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fail")
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
