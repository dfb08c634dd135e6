//! Retry policy with exponential backoff.
//!
//! One [`RetryPolicy`] is shared by every transfer worker (download and
//! upload alike) and by the ping estimator. Workers count consecutive chunk
//! failures against it; ping probes go through [`retry_async`].

use log::{debug, warn};
use std::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Default number of retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (in milliseconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Maximum delay cap for exponential backoff (in milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 1000;

/// Retry behavior for transient transfer failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self { max_retries, base_delay_ms, max_delay_ms }
    }

    /// Calculate the delay for a given attempt number using exponential backoff.
    ///
    /// The delay is calculated as: base_delay * 2^attempt, capped at max_delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
        let capped_delay_ms = delay_ms.min(self.max_delay_ms);
        Duration::from_millis(capped_delay_ms)
    }

    /// Returns true once `consecutive_failures` has used up the initial
    /// attempt plus every retry.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures > self.max_retries
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryResult<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed after all retries.
    Failed {
        /// The last error that occurred.
        last_error: Box<dyn Error + Send + Sync>,
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Execute an async operation with retry logic and exponential backoff.
///
/// Returns the first success, or the last error together with the number of
/// attempts made once the policy is exhausted.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> RetryResult<T>
where
    E: Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total_attempts = policy.max_retries + 1;
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt - 1);
            debug!(
                "{}: Retry attempt {}/{} after {:?} delay",
                operation_name, attempt, policy.max_retries, delay
            );
            sleep(delay).await;
        }

        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        "{}: Succeeded on attempt {}",
                        operation_name,
                        attempt + 1
                    );
                }
                return RetryResult::Success(result);
            }
            Err(e) => {
                attempt += 1;

                if attempt < total_attempts {
                    warn!("{}: Attempt {} failed: {}", operation_name, attempt, e);
                } else {
                    warn!(
                        "{}: All {} attempts failed. Last error: {}",
                        operation_name, total_attempts, e
                    );
                    return RetryResult::Failed {
                        last_error: Box::new(e),
                        attempts: total_attempts,
                    };
                }
            }
        }
    }
}
