//! Bounded retry for buffered upstream calls.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::providers::ProviderError;

// MARK: - Retry Policy

/// Exponential backoff with jitter, applied to transport failures only.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_backoff_ms.max(config.retry_backoff_ms),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Upper bound of the sleep before retry number `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// A jittered sleep in `[ceiling / 2, ceiling]`.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.backoff_ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let ms = rand::rng().random_range(ceiling / 2..=ceiling);
        Duration::from_millis(ms)
    }

    pub fn should_retry(&self, error: &ProviderError, retries_done: u32) -> bool {
        retries_done < self.max_retries && error.is_retryable()
    }
}

// MARK: - Retry Executor

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut retries = 0u32;

    loop {
        match operation().await {
            Ok(result) => {
                if retries > 0 {
                    debug!(retries, "Upstream request succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.should_retry(&error, retries) {
                    if retries > 0 {
                        warn!(retries, error = %error, "Upstream retries exhausted");
                    }
                    return Err(error);
                }
                retries += 1;
                let backoff = policy.calculate_backoff(retries);
                warn!(
                    attempt = retries,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Upstream request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// MARK: - Tests
