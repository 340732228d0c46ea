//! Retry budget, exponential backoff and call timeouts.

use std::future::Future;
use std::time::Duration;

use crate::error::ExternalError;
use crate::models::EngineConfig;

/// Retry policy for stage transitions that depend on an external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per transition
    pub budget: u32,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            budget: config.retry_budget.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Policy with no waiting between attempts.
    pub fn immediate(budget: u32) -> Self {
        Self {
            budget: budget.max(1),
            base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0 for the first retry):
    /// `base * 2^retry`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether `attempts` failed attempts use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.budget
    }
}

/// Run an external call under a timeout; expiry is reported as `Timeout`.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    what: &str,
    call: F,
) -> std::result::Result<T, ExternalError>
where
    F: Future<Output = std::result::Result<T, ExternalError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::timeout(format!(
            "{what} did not finish within {}ms",
            timeout.as_millis()
        ))),
    }
}
