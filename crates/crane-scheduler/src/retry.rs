//! Bounded retry with exponential backoff and jitter
//!
//! Used for substrate teardown calls, which must converge even when the
//! substrate is slow or unresponsive.

use rand::Rng;
use std::time::Duration;
use tracing::{error, warn};

/// Retry schedule for a transiently failing operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn bounded(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Attempts actually made before giving up
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds or `config.attempts()` is exhausted,
/// returning the last error in the latter case.
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
    let max_attempts = config.attempts();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
