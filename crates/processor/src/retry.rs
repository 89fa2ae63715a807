//! Bounded exponential backoff
//!
//! Used for checkpoint writes and sink deliveries. Attempts are 1-based; the
//! delay after attempt `n` is `initial_delay * multiplier^(n-1)`, capped at
//! `max_delay`.

use crate::error::{ProcessorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt (milliseconds)
    pub initial_delay_ms: u64,

    /// Upper bound of a single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries - fail after the first attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Default policy for sink deliveries
    pub fn sink_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Default policy for checkpoint writes
    pub fn checkpoint_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Validate the policy; `name` identifies it in the error message
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProcessorError::config(format!(
                "{}.max_attempts must be greater than 0",
                name
            )));
        }

        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(ProcessorError::config(format!(
                "{}.backoff_multiplier must be a finite value >= 1.0",
                name
            )));
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ProcessorError::config(format!(
                "{}.max_delay_ms must not be smaller than initial_delay_ms",
                name
            )));
        }

        Ok(())
    }

    /// Delay to wait after the given failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempts are exhausted. Returns the last error on failure.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> std::result::Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(20), Duration::from_millis(5_000));
    }

    #[test]
    fn test_validation() {
        assert!(RetryConfig::default().validate("retry").is_ok());
        assert!(RetryConfig {
            max_attempts: 0,
            ..Default::default()
        }
        .validate("retry")
        .is_err());
        assert!(RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        }
        .validate("retry")
        .is_err());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<u32, String> =
            retry_with_backoff(&fast(), "test", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {} failed", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), String> =
            retry_with_backoff(&fast(), "test", |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), String> =
            retry_with_backoff(&fast(), "test", |e: &String| e != "fatal", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
