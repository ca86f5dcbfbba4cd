//! Retrying fallible async work
//!
//! Two layers use this module. Individual Vault requests retry connection
//! failures a couple of times with exponential backoff. The orchestration
//! loop retries the entire bootstrap pipeline with a fixed pause, and turns
//! an exhausted budget into a fatal error.

use crate::error::{VaultsmithError, VaultsmithResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Pause between two attempts
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Same pause after every failure
    Fixed(Duration),
    /// `initial * factor^(n - 1)` after the n-th failure, capped at `ceiling`
    Exponential {
        initial: Duration,
        factor: f64,
        ceiling: Duration,
    },
}

impl BackoffStrategy {
    /// Pause after the given (1-based) failed attempt
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(pause) => *pause,
            BackoffStrategy::Exponential {
                initial,
                factor,
                ceiling,
            } => {
                let scale = factor.powi(failed_attempt.saturating_sub(1) as i32);
                initial.mul_f64(scale).min(*ceiling)
            }
        }
    }
}

/// Attempt budget and failure policy for [`retry`]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Errors for which another attempt is made
    pub is_retryable: fn(&VaultsmithError) -> bool,
    /// Name used in log lines
    pub label: String,
    /// Wrap the last error in `RetriesExhausted` once the budget is spent
    pub exhausted_is_fatal: bool,
}

impl RetryConfig {
    /// Outer loop around the whole bootstrap pipeline
    pub fn for_orchestration(attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: attempts,
            backoff: BackoffStrategy::Fixed(wait),
            is_retryable: VaultsmithError::is_retryable,
            label: "vault bootstrap".to_string(),
            exhausted_is_fatal: true,
        }
    }

    /// Low-level retry for a single Vault HTTP request
    ///
    /// Two retries after the first attempt, backing off by a factor of two.
    /// Only connection-level failures are retried; an HTTP error response is
    /// an answer, not a transient failure.
    pub fn for_vault_requests(path: &str) -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_secs(2),
                factor: 2.0,
                ceiling: Duration::from_secs(30),
            },
            is_retryable: |e| matches!(e, VaultsmithError::Transport { .. }),
            label: path.to_string(),
            exhausted_is_fatal: false,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget in `config` is spent
pub async fn retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> VaultsmithResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VaultsmithResult<T>>,
{
    let label = config.label.as_str();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !(config.is_retryable)(&error) {
            debug!("{}: not retrying {}", label, error);
            return Err(error);
        }

        let remaining = config.max_attempts.saturating_sub(attempt);
        if remaining == 0 {
            warn!("{} gave up after {} attempts: {}", label, attempt, error);
            return Err(if config.exhausted_is_fatal {
                VaultsmithError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                }
            } else {
                error
            });
        }

        let pause = config.backoff.delay(attempt);
        warn!("{} attempt {} failed: {}", label, attempt, error);
        warn!(
            "Retrying in {} seconds, {} retries left",
            pause.as_secs(),
            remaining
        );
        sleep(pause).await;
    }
}
