//! Pool policy configuration
//!
//! Every field has a default, so an empty `[pool]` table (or no table at
//! all) yields the recommended policy: open after 3 consecutive failures,
//! 60s base cool-down doubling per re-open up to one hour.

use std::time::Duration;

use serde::Deserialize;

/// How to order keys that share the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionTiebreak {
    /// Lowest `usage_count` first; spreads load evenly.
    #[default]
    LeastUsed,
    /// Rotate through equal-priority keys regardless of usage.
    RoundRobin,
}

/// Circuit breaker and selection policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Consecutive failures that open a `Closed` circuit.
    pub failure_threshold: u32,
    /// Cool-down after the first open; doubles on every trial failure.
    pub base_cooldown_secs: u64,
    /// Upper bound for the doubled cool-down.
    pub max_cooldown_secs: u64,
    /// A trial unreported for this long is considered abandoned and the
    /// key may be offered as a new trial.
    pub trial_timeout_secs: u64,
    pub selection_tiebreak: SelectionTiebreak,
    /// Conditional-write losses tolerated by a single `acquire`.
    pub max_selection_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_secs: 60,
            max_cooldown_secs: 3600,
            trial_timeout_secs: 300,
            selection_tiebreak: SelectionTiebreak::LeastUsed,
            max_selection_attempts: 8,
        }
    }
}

impl PoolConfig {
    /// Reject policies the state machine cannot honor.
    pub fn validate(&self) -> common::Result<()> {
        if self.failure_threshold == 0 {
            return Err(common::Error::config(
                "failure_threshold must be greater than 0",
            ));
        }
        if self.base_cooldown_secs == 0 {
            return Err(common::Error::config(
                "base_cooldown_secs must be greater than 0",
            ));
        }
        if self.max_cooldown_secs < self.base_cooldown_secs {
            return Err(common::Error::config(format!(
                "max_cooldown_secs ({}) must be >= base_cooldown_secs ({})",
                self.max_cooldown_secs, self.base_cooldown_secs
            )));
        }
        if self.trial_timeout_secs == 0 {
            return Err(common::Error::config(
                "trial_timeout_secs must be greater than 0",
            ));
        }
        if self.max_selection_attempts == 0 {
            return Err(common::Error::config(
                "max_selection_attempts must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_secs(self.trial_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recommended_policy() {
        let config = PoolConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.base_cooldown_secs, 60);
        assert_eq!(config.trial_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_cooldown_secs, 3600);
        assert_eq!(config.selection_tiebreak, SelectionTiebreak::LeastUsed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_table_uses_defaults() {
        let config: PoolConfig = toml::from_str("").unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.trial_timeout_secs, 300);
    }

    #[test]
    fn partial_table_overrides_fields() {
        let config: PoolConfig = toml::from_str(
            r#"
failure_threshold = 5
selection_tiebreak = "round_robin"
"#,
        )
        .unwrap();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.selection_tiebreak, SelectionTiebreak::RoundRobin);
        assert_eq!(config.base_cooldown_secs, 60);
    }

    #[test]
    fn zero_threshold_rejected() {
        let config = PoolConfig {
            failure_threshold: 0,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"), "got: {err}");
    }

    #[test]
    fn max_below_base_rejected() {
        let config = PoolConfig {
            base_cooldown_secs: 120,
            max_cooldown_secs: 60,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = PoolConfig {
            max_selection_attempts: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
