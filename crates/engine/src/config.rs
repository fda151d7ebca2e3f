use std::time::Duration;

use bucketlift_transfer::StrategyConfig;
use serde::{Deserialize, Serialize};

/// Engine tunables. Every field has a default, so partial config files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrent part uploads within one task.
    pub max_concurrency: usize,
    /// Largest part count the object store accepts for one upload.
    pub max_parts: u32,
    pub strategy: StrategyConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 6,
            max_parts: 10_000,
            strategy: StrategyConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Backoff for retrying a failed part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub part_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            part_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay before retry `attempt` (1-based),
    /// with ±25% jitter so parallel parts do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let initial = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let max = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let capped = (initial * self.backoff_factor.powi(exp)).min(max);
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlift_transfer::MIB;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 6);
        assert_eq!(config.max_parts, 10_000);
        assert_eq!(config.strategy.multipart_threshold, 16 * MIB);
        assert_eq!(config.retry.part_retries, 3);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_concurrency": 2, "retry": {"part_retries": 0}}"#)
                .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry.part_retries, 0);
        assert_eq!(config.retry.initial_delay_ms, 500);
        assert_eq!(config.strategy, StrategyConfig::default());
    }

    #[test]
    fn delay_backoff() {
        let policy = RetryPolicy::default();
        // Base delays: 0.5s, 1s, 2s, 4s, 8s, 10s (capped), 10s...
        let expected_base = [0.5, 1.0, 2.0, 4.0, 8.0, 10.0, 10.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = policy.delay_for_attempt((i + 1) as u32).as_secs_f64();
            assert!(
                secs >= base * 0.74 && secs <= base * 1.26,
                "attempt {}: {secs}s not within jitter of {base}s",
                i + 1
            );
        }
    }

    #[test]
    fn zero_delay_policy() {
        let policy = RetryPolicy {
            initial_delay_ms: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }
}
