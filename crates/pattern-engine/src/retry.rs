//! Exponential backoff for pattern store calls

use crate::config::RuntimeConfig;
use crate::error::EngineError;
use std::future::Future;
use std::time::Duration;

/// Retries transient store failures with doubling delays
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total tries, including the first one
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            attempts: config.store_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.store_retry_base_ms),
        }
    }

    /// No retries
    #[must_use]
    pub fn once() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
