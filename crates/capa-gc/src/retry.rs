//! Retry utilities with exponential backoff and jitter.
//!
//! Cloud calls made during garbage collection fail transiently all the time:
//! list calls get throttled, deletes race with the provider's own cleanup and
//! report dependency violations. Everything goes through the helpers here so
//! that the backoff shape is the same across discovery and deletion.
//!
//! # Example
//!
//! ```ignore
//! use capa_gc::retry::{retry_if, RetryConfig};
//!
//! let page = retry_if(
//!     &RetryConfig::with_max_attempts(5),
//!     "list load-balancer",
//!     |e: &CloudError| e.kind == CloudErrorKind::Throttling,
//!     || async { cloud.list_tagged(kind, &filter, page.clone()).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "crate::config::duration_secs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound on total time spent retrying, measured from the first
    /// attempt. `None` means only `max_attempts` applies.
    #[serde(with = "crate::config::opt_duration_secs")]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_elapsed: Some(Duration::from_secs(120)),
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

    /// Create a config that never retries
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    /// Delay before the retry following `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Apply 0.5x to 1.5x jitter to a delay
pub fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries every error until success, `max_attempts` or `max_elapsed`.
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
    retry_if(config, operation_name, |_: &E| true, operation).await
}

/// Execute an async operation, retrying only the errors `should_retry`
/// accepts.
///
/// Rejected errors are returned immediately. Retrying also stops when the
/// next sleep would take the total time past `max_elapsed`.
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
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        let delay = jittered(config.delay_for(attempt));

        if let Some(limit) = config.max_elapsed {
            if started.elapsed() + delay > limit {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Operation failed, retry window exhausted"
                );
                return Err(e);
            }
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
