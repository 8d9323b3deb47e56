//! Retry policy: pure backoff computation plus a generic retrying driver.
//!
//! The policy is independent of the executor; tool nodes attach one, and
//! callers of the branch coordinator may wrap individual branches
//! themselves.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Hard ceiling applied when a policy does not set `max_backoff_ms`.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential-backoff retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure. 0 means fail fast.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter: bool,
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: None,
            jitter: false,
        }
    }

    /// 3 retries, 1s base doubling up to the 30s cap.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: Some(DEFAULT_MAX_BACKOFF_MS),
            jitter: false,
        }
    }

    /// 5 quick retries with jitter, for flaky-but-cheap calls.
    pub fn fast() -> Self {
        Self {
            max_retries: 5,
            backoff_ms: 250,
            backoff_multiplier: 2.0,
            max_backoff_ms: Some(5_000),
            jitter: true,
        }
    }

    /// 2 retries with a slower 2s base.
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: Some(DEFAULT_MAX_BACKOFF_MS),
            jitter: false,
        }
    }
}

/// Partial policy for per-node overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyOverrides {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

/// Produces a new policy with `overrides` taking precedence. `base` is
/// never mutated.
pub fn merge_retry_policy(base: &RetryPolicy, overrides: &RetryPolicyOverrides) -> RetryPolicy {
    RetryPolicy {
        max_retries: overrides.max_retries.unwrap_or(base.max_retries),
        backoff_ms: overrides.backoff_ms.unwrap_or(base.backoff_ms),
        backoff_multiplier: overrides
            .backoff_multiplier
            .unwrap_or(base.backoff_multiplier),
        max_backoff_ms: overrides.max_backoff_ms.or(base.max_backoff_ms),
        jitter: overrides.jitter.unwrap_or(base.jitter),
    }
}

/// Delay before retrying after a failed `attempt` (0-based):
/// `min(backoff_ms * multiplier^attempt, cap)`, jittered ±25% when the
/// policy asks for it. The cap holds even with jitter applied.
pub fn calculate_backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let cap = policy.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS);
    let raw = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let mut delay_ms = raw.min(cap as f64);
    if policy.jitter {
        let factor = 0.75 + fastrand::f64() * 0.5;
        delay_ms = (delay_ms * factor).min(cap as f64);
    }
    Duration::from_millis(delay_ms.round() as u64)
}

/// Drives `op` under `policy`. `on_error(message, attempt, will_retry)`
/// fires on every failure, including the final one.
pub async fn with_retry<T, F, Fut, O>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_error: O,
) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    O: FnMut(&str, u32, bool),
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let will_retry = attempt < policy.max_retries;
                on_error(&error.to_string(), attempt, will_retry);
                if !will_retry {
                    return Err(error);
                }
                let delay = calculate_backoff_delay(policy, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after failure"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
