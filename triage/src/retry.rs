//! Retry policy for store calls.
//!
//! An explicit value (attempts, initial delay, backoff factor) applied
//! around each call with [`RetryPolicy::run`]. Only errors that report
//! themselves as transient are retried; the last error is surfaced once
//! attempts are exhausted.
//!
//! # Usage
//!
//! ```rust,ignore
//! let policy = RetryPolicy::default(); // 3 attempts, 1s, ×2
//! let steps = policy.run("list_steps", || store.list_steps(&thread_id)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call (≥ 1).
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt (≥ 1.0).
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Create a validated policy.
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64) -> Result<Self, ConfigError> {
        let policy = Self {
            max_attempts,
            initial_delay_ms: u64::try_from(initial_delay.as_millis()).unwrap_or(u64::MAX),
            backoff_factor,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Single attempt, no delay.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            backoff_factor: 1.0,
            max_delay_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                name: "retry.backoff_factor",
                reason: format!("must be >= 1.0, got {}", self.backoff_factor),
            });
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay =
            self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32 - 1);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = op_name, attempt, "Store call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(op = op_name, attempt, error = %err, "Store call failed");
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 1s initial delay, ×2 backoff, 30s cap.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Flaky,
        Fatal,
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            matches!(self, FakeError::Flaky)
        }
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 1_500,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(5), Duration::from_millis(1_500));
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::new(0, Duration::from_secs(1), 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(1), 0.5).is_err());
        assert!(RetryPolicy::new(3, Duration::from_millis(10), 1.0).is_ok());
    }

    #[test]
    fn test_oversized_delay_saturates() {
        let policy = RetryPolicy::new(3, Duration::MAX, 2.0).unwrap();
        assert_eq!(policy.initial_delay_ms, u64::MAX);
        assert_eq!(policy.delay_after(1), Duration::from_millis(policy.max_delay_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();

        let result: Result<&str, FakeError> = policy
            .run("flaky", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FakeError::Flaky)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_surface_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result: Result<(), FakeError> = policy
            .run("always_flaky", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError::Flaky)
                }
            })
            .await;

        assert_eq!(result, Err(FakeError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result: Result<(), FakeError> = policy
            .run("fatal", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError::Fatal)
                }
            })
            .await;

        assert_eq!(result, Err(FakeError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_json_roundtrip() {
        let json = serde_json::to_string(&RetryPolicy::default()).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, RetryPolicy::default());
    }
}
