//! Bounded retry with exponential backoff and jitter.
//!
//! Every call to the cloud provider goes through [`retry_if`] so that transient
//! transport and server errors are absorbed without each call site growing its
//! own sleep loop. The attempt budget is a fixed count rather than a wall-clock
//! window, so the behavior is the same no matter how long the run has been going.
//!
//! ```ignore
//! let image = retry_if(
//!     &RetryConfig::default(),
//!     "get_image",
//!     |e: &Error| e.is_retryable(),
//!     || async { client.get_image("debian-cloud", "debian-12").await },
//! )
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;

/// How often and how patiently an operation is retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failure
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default backoff with a different attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }

    /// Un-jittered delay that follows the `attempt`th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry `operation` on every error until it succeeds or the budget runs out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, |_| true, operation).await
}

/// Retry `operation` while `should_retry` accepts the error.
///
/// Errors rejected by `should_retry` are returned immediately. When the attempt
/// budget is exhausted the last error is returned.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => {
                tracing::debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed with a non-retryable error"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let mut delay = config.delay_for(attempt);
                if config.jitter {
                    let factor = rand::thread_rng().gen_range(0.5..1.5);
                    delay = Duration::from_secs_f64(delay.as_secs_f64() * factor);
                }

                tracing::warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
