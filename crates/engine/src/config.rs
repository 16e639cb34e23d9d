//! Engine configuration.
//!
//! Every field has a default so a partial JSON file (or none at all) yields
//! a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tenant::TenantLimits;

/// Attempt limit plus capped exponential back-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 are treated
    /// as 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Tuning knobs for compilation, scheduling and admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-execution step concurrency when a workflow does not set one.
    pub default_max_concurrency: usize,
    /// Step timeout when neither the node nor the workflow sets one.
    pub default_step_timeout_ms: u64,
    /// Step retry policy when neither the node nor the workflow sets one.
    pub default_retry: RetryPolicy,
    /// Overall deadline of one execution.
    pub execution_timeout_ms: u64,
    /// Retry policy for persistence and executor-dispatch failures.
    pub infra_retry: RetryPolicy,
    /// Limits for tenants the registry does not know.
    pub default_tenant_limits: TenantLimits,
    /// How often tenant limits are reloaded from the database.
    pub tenant_refresh_secs: u64,
    /// How long a finished execution stays in the scheduler's table before
    /// status reads fall through to the store.
    pub terminal_retention_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: 4,
            default_step_timeout_ms: 30_000,
            default_retry: RetryPolicy::default(),
            execution_timeout_ms: 300_000,
            infra_retry: RetryPolicy::default(),
            default_tenant_limits: TenantLimits::default(),
            tenant_refresh_secs: 60,
            terminal_retention_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn tenant_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.tenant_refresh_secs.max(1))
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_attempts: 10, base_delay_ms: 100, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_attempts_means_one() {
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "default_max_concurrency": 8 }"#).unwrap();
        assert_eq!(config.default_max_concurrency, 8);
        assert_eq!(config.execution_timeout_ms, 300_000);
        assert_eq!(config.default_retry, RetryPolicy::default());
    }
}
