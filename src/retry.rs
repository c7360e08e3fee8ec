// Bounded exponential backoff for storage writes
//
// Used at the point of use for retryable (Unavailable) failures:
// - Exponential backoff (base, 2x base, 4x base, ...)
// - Bounded number of attempts, never retries client errors
// - Jitter to prevent thundering herd on a recovering store

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Retry strategy configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds (default 20ms)
    pub base_delay_ms: u64,
    /// Maximum number of retries after the first attempt (default 4)
    pub max_retries: u32,
    /// Cap on a single delay in milliseconds (default 1000ms)
    pub max_delay_ms: u64,
    /// Use exponential backoff (default true)
    pub use_exponential_backoff: bool,
    /// Add jitter to delay (default true)
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 20,
            max_retries: 4,
            max_delay_ms: 1000,
            use_exponential_backoff: true,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Retry decision for a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry with this delay in milliseconds
    Retry(u64),
    /// Give up and surface the failure
    GiveUp,
}

/// Calculate retry delay based on attempt number
///
/// delay = min(base * 2^attempt, max_delay) +/- 20% jitter
pub fn calculate_retry_delay(attempt: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= config.max_retries {
        debug!("Max retries ({}) exceeded, giving up", config.max_retries);
        return RetryDecision::GiveUp;
    }

    let delay_ms = if config.use_exponential_backoff {
        config
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
    } else {
        config.base_delay_ms
    };
    let delay_ms = delay_ms.min(config.max_delay_ms);

    let delay_ms = if config.use_jitter && delay_ms > 0 {
        let jitter = (delay_ms as f64 * 0.2) as u64;
        let mut rng = rand::rng();
        let random_jitter = rng.random_range(0..=jitter);
        if rng.random_bool(0.5) {
            delay_ms.saturating_add(random_jitter)
        } else {
            delay_ms.saturating_sub(random_jitter)
        }
    } else {
        delay_ms
    };

    RetryDecision::Retry(delay_ms)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `on_retry` is called before each backoff sleep.
pub async fn retry_unavailable<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut op: F,
    mut on_retry: impl FnMut(u32),
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match calculate_retry_delay(attempt, config) {
                RetryDecision::Retry(delay_ms) => {
                    warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms,
                        error = %err,
                        "Retrying after storage failure"
                    );
                    on_retry(attempt);
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                RetryDecision::GiveUp => {
                    return Err(EngineError::Unavailable(format!(
                        "{} failed after {} attempts: {}",
                        what,
                        attempt + 1,
                        err
                    )));
                }
            },
            Err(err) => return Err(err),
        }
    }
}
