use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;

const MAX_DELAY: Duration = Duration::from_secs(10);

/// Bounded exponential backoff shared by the expander and the download manager.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: MAX_DELAY.max(config.retry_base_delay()),
            jitter: true,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter never pushes the delay past max_delay.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms = u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit = jitter_range_ms.min(remaining_ms);
        if limit == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..limit))
    }
}

pub enum RetryAction<T, E> {
    Success(T),
    /// Transient failure, worth another attempt.
    Retry(E),
    Fail(E),
}

/// Errors that can represent an operation abandoned through its cancellation token.
pub trait Cancellable {
    fn cancelled() -> Self;
}

/// Runs `operation` until it succeeds, fails permanently, runs out of attempts or the token
/// fires. Backoff sleeps race the token.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, token: &CancellationToken, operation: F) -> Result<T, E>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T, E>>,
    E: Cancellable + Display,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(E::cancelled());
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(E::cancelled()),
            outcome = operation(attempt) => outcome,
        };

        match outcome {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Attempt {}/{} failed: {}, retrying in {}ms",
                    attempt + 1,
                    policy.max_retries + 1,
                    err,
                    delay.as_millis()
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(E::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Connection level failures are transient; builder and redirect errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
