//! Bounded exponential backoff around backend calls.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{BackendError, BackendKind, BackendResult, MemoryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying transient and rate-limited failures.
    ///
    /// Exhausted retries surface as [`MemoryError::BackendUnavailable`];
    /// permanent failures surface after the first attempt as [`MemoryError::Backend`].
    pub fn run<T>(
        &self,
        backend: BackendKind,
        operation: &str,
        mut op: impl FnMut() -> BackendResult<T>,
    ) -> Result<T, MemoryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        backend = %backend,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "transient backend failure, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(exhausted(err, attempt)),
            }
        }
    }
}

fn exhausted(err: BackendError, attempts: u32) -> MemoryError {
    if err.is_retryable() {
        MemoryError::BackendUnavailable {
            backend: err.backend,
            attempts,
            message: err.message,
        }
    } else {
        MemoryError::Backend(err)
    }
}
