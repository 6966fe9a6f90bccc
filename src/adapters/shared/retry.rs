//! Retry with exponential backoff
//!
//! Generic retry helper used by the dispatcher. Transient failures
//! (`RateLimitExceeded`, `ExchangeUnavailable`) are retried with
//! `min(initial * 2^retry, max) + jitter`; anything else is returned as-is.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapters::errors::{ExchangeError, ExchangeResult};

/// Retry budget and backoff shape for one exchange profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Base delay in milliseconds (doubles each retry)
    pub initial_delay_ms: u64,
    /// Maximum delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Same backoff shape, exactly one attempt
    pub fn single_attempt(&self) -> Self {
        Self {
            max_retries: 0,
            ..*self
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter
    ///
    /// A server-provided `Retry-After` raises the delay but never past
    /// `max_delay_ms`.
    pub fn base_delay_ms(&self, retry: u32, retry_after_ms: Option<u64>) -> u64 {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let backoff = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        match retry_after_ms {
            Some(hint) => backoff.max(hint.min(self.max_delay_ms)),
            None => backoff,
        }
    }

    /// Full delay including random jitter in `0..=jitter_ms`
    pub fn delay(&self, retry: u32, retry_after_ms: Option<u64>) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.base_delay_ms(retry, retry_after_ms).saturating_add(jitter))
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted
///
/// `op` receives the 0-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    op: F,
) -> ExchangeResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    retry_with_backoff_cancellable(policy, label, &CancellationToken::new(), op).await
}

/// [`retry_with_backoff`] that also aborts when `cancel` fires
///
/// Cancellation is observed before each attempt and during backoff sleeps.
/// The attempt future itself is expected to watch the token too.
pub async fn retry_with_backoff_cancellable<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> ExchangeResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ExchangeError::Cancelled(format!(
                "{}: cancelled before attempt {}",
                label,
                attempt + 1
            )));
        }

        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_transient() {
            return Err(error);
        }
        if attempt >= policy.max_retries {
            if policy.max_retries == 0 {
                return Err(error);
            }
            tracing::warn!(
                label,
                attempts = attempt + 1,
                error = %error,
                "Retry budget exhausted"
            );
            return Err(ExchangeError::ExhaustedRetries {
                attempts: attempt + 1,
                last: Box::new(error),
            });
        }

        let delay = policy.delay(attempt, error.retry_after_ms());
        tracing::info!(
            label,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ExchangeError::Cancelled(format!(
                    "{}: cancelled during backoff after attempt {}",
                    label,
                    attempt + 1
                )));
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
