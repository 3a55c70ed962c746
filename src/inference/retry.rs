use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use super::error::InferenceError;

/// Configuration for the bounded retry wrapper around generation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failure. Zero disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Run `call` until it succeeds or `max_retries` extra attempts are spent.
///
/// A rate-limit reply stretches the wait to at least its `retry-after`.
/// Non-transient errors are returned immediately.
pub async fn retry_call<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, InferenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InferenceError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_retries && err.is_transient() => {
                attempt += 1;
                let mut delay_ms = config.delay_for_attempt(attempt);
                if let InferenceError::RateLimited { retry_after_ms } = &err {
                    delay_ms = delay_ms.max(*retry_after_ms);
                }
                warn!(
                    attempt,
                    max = config.max_retries,
                    delay_ms,
                    error = %err,
                    "retrying inference call"
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
