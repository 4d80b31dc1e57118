//! Resilience utilities: retry with exponential backoff for transient errors.
//!
//! - [`RetryConfig`]: backoff schedule and per-attempt timeout
//! - [`retry_transient`]: repeat one unit of work (page fetch, push,
//!   checkpoint write) until it succeeds, fails permanently, or runs out of
//!   attempts
//!
//! A unit of work is never skipped: the caller either gets its result or an
//! error, and decides whether the error is fatal for the collection.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> mirror_engine::error::Result<()> {
//! use mirror_engine::resilience::{retry_transient, RetryConfig};
//!
//! let retry = RetryConfig::testing();
//! let rows = retry_transient(&retry, "find_page", || async {
//!     Ok::<_, mirror_engine::MirrorError>(vec![1, 2, 3])
//! })
//! .await?;
//! assert_eq!(rows.len(), 3);
//! # Ok(())
//! # }
//! ```

use crate::error::{MirrorError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt. A timed-out attempt counts as a
    /// transient failure.
    pub operation_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            operation_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Infinite retry for the long-running mirror (never give up!).
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s (cap), retry forever
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX, // Infinite retries
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // Cap at 5 minutes
            backoff_factor: 2.0,
            operation_timeout: Duration::from_secs(300),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            operation_timeout: Duration::from_secs(5),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached.
pub async fn retry_transient<F, Fut, T>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(config.operation_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(MirrorError::source_transient(
                operation,
                format!("timed out after {:?}", config.operation_timeout),
            )),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
