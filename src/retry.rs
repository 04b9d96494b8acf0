//! Retry utilities with exponential backoff and jitter.
//!
//! Two flavors share one [`RetryConfig`]:
//! - [`retry_with_backoff`] loops an async operation in place (startup calls
//!   such as CRD install or the first API call)
//! - [`RetryConfig::delay_for_attempt`] computes the requeue delay for the
//!   n-th consecutive failure of a reconcile, so controllers can back off per
//!   object without blocking a worker
//!
//! # Example
//!
//! ```ignore
//! use fanout_channel::retry::{retry_with_backoff, RetryConfig};
//!
//! let crds = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "install_crd",
//!     || async { install_crd(&client).await },
//! ).await?;
//! ```

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Backoff used when a reconcile keeps failing: starts at 1s, caps at 5m
    pub fn reconcile() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retrying after the `attempt`-th consecutive failure (1-based).
    ///
    /// Deterministic (no jitter) so requeue intervals are predictable in tests
    /// and logs. Attempt 0 is treated as attempt 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

/// Consecutive reconcile failures per object ("namespace/name")
///
/// Counters are reset by a clean pass and dropped when the object goes away.
#[derive(Debug, Default)]
pub struct FailureCounters {
    counts: DashMap<String, u32>,
}

impl FailureCounters {
    /// Record one more failure for `key` and return the running count
    pub fn record(&self, key: &str) -> u32 {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget `key`
    pub fn clear(&self, key: &str) {
        self.counts.remove(key);
    }

    /// Drop counters for keys not in `live`
    pub fn retain(&self, live: &HashSet<String>) {
        self.counts.retain(|key, _| live.contains(key));
    }

    /// Number of objects currently failing
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True if nothing is failing
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let delay = config.delay_for_attempt(attempt);
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}
