// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable, cancellable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use status_engine::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, Some(5));
//!
//! // Upstream: a few quick attempts, then fall back to stale data
//! let upstream = RetryConfig::upstream();
//! assert_eq!(upstream.max_attempts, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual cache operations
/// - [`RetryConfig::upstream()`] - Bounded retry for upstream service calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first. `None` retries until cancelled.
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::upstream()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual cache operations.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Bounded retry for upstream HTTP services.
    #[must_use]
    pub fn upstream() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay slept after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The token was cancelled before an attempt or during a backoff sleep.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: usize },

    /// Every attempt failed; carries the last underlying error.
    #[error("failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    #[must_use]
    pub fn attempts(&self) -> usize {
        match self {
            Self::Cancelled { attempts } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, if the attempt budget was exhausted.
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Run `operation` until it succeeds, the attempt budget runs out, or
/// `token` is cancelled.
///
/// Cancellation is checked before every attempt and interrupts backoff sleeps.
pub async fn retry<F, Fut, T, E>(
    token: &CancellationToken,
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(token, operation_name, config, operation, |_| true).await
}

/// Like [`retry`], but gives up immediately on errors `is_transient`
/// rejects. Such a failure is reported as exhausted after that attempt.
pub async fn retry_if<F, Fut, T, E, P>(
    token: &CancellationToken,
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    is_transient: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay.min(config.max_delay);
    let mut attempts = 0;

    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled { attempts });
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled { attempts }),
            result = operation() => result,
        };
        attempts += 1;

        match result {
            Ok(val) => {
                if attempts > 1 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                if !is_transient(&err) {
                    warn!(operation = operation_name, attempts, error = %err, "Operation failed, not retryable");
                    return Err(RetryError::Exhausted { attempts, last: err });
                }
                if let Some(max) = config.max_attempts {
                    if attempts >= max {
                        warn!(operation = operation_name, attempts, error = %err, "Operation failed, giving up");
                        return Err(RetryError::Exhausted { attempts, last: err });
                    }
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts = ?config.max_attempts,
                    error = %err,
                    retry_in = ?delay,
                    "Operation failed, retrying"
                );

                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RetryError::Cancelled { attempts }),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let token = CancellationToken::new();
        let result: Result<i32, RetryError<TestError>> =
            retry(&token, "test_op", &RetryConfig::test(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, RetryError<TestError>> = retry(&token, "test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, RetryError<TestError>> = retry(&token, "test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                Err(TestError(format!("failure #{}", n)))
            }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts: 3, last }) => assert_eq!(last.0, "failure #3"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicUsize::new(0);

        let result: Result<i32, RetryError<TestError>> = retry(&token, "test_op", &RetryConfig::test(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_sleep() {
        let token = CancellationToken::new();
        let config = RetryConfig {
            max_attempts: None,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: Result<i32, RetryError<TestError>> =
            retry(&token, "test_op", &config, || async { Err(TestError("down".into())) }).await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let result: Result<i32, RetryError<TestError>> = retry_if(
            &token,
            "test_op",
            &RetryConfig::test(),
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError("wrong type".into())) }
            },
            |e| e.0 != "wrong type",
        )
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_attempts, Some(5));
        assert_eq!(RetryConfig::query().max_attempts, Some(3));
        assert_eq!(RetryConfig::upstream().max_attempts, Some(3));
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_attempts: Some(5),
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: Some(5),
        };

        assert_eq!(config.delay_for(2), Duration::from_secs(5));
        assert_eq!(config.delay_for(10), Duration::from_secs(5));
    }
}
