//! Engine configuration.
//!
//! Loaded from JSON; every field has a default so a config file only needs to
//! name what it changes. Durations are milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::partition::{DatePeriod, PartitionScheme};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub partition: PartitionConfig,
    pub dispatcher: DispatcherConfig,
    pub reaper: ReaperConfig,
    pub retry: RetryConfig,
    pub verification: VerificationConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| QueueError::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| QueueError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.partition.validate()?;
        self.dispatcher.validate()?;
        self.reaper.validate()?;
        self.retry.validate()?;
        self.verification.validate()
    }
}

fn invalid(message: impl Into<String>) -> QueueError {
    QueueError::Config(message.into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Logical table name, prefix of every partition name.
    pub table: String,
    pub scheme: PartitionScheme,
    /// Range schemes: how many partitions to keep ahead of demand.
    pub horizon: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            table: "tasks".to_string(),
            scheme: PartitionScheme::Hash { buckets: 16 },
            horizon: 3,
        }
    }
}

impl PartitionConfig {
    fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(invalid("partition.table must not be empty"));
        }
        match &self.scheme {
            PartitionScheme::Hash { buckets: 0 } => {
                Err(invalid("partition.scheme.buckets must be > 0"))
            }
            PartitionScheme::IntegerRange { block_size } if *block_size <= 0 => {
                Err(invalid("partition.scheme.block_size must be > 0"))
            }
            PartitionScheme::DateRange { .. } | PartitionScheme::IntegerRange { .. }
                if self.horizon == 0 =>
            {
                Err(invalid("partition.horizon must be > 0 for range schemes"))
            }
            _ => Ok(()),
        }
    }

    pub fn daily(table: impl Into<String>, horizon: u32) -> Self {
        Self {
            table: table.into(),
            scheme: PartitionScheme::DateRange {
                period: DatePeriod::Daily,
            },
            horizon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    /// Rows per poll, across all partitions in scope.
    pub poll_limit: usize,
    /// Concurrent executions per dispatcher.
    pub workers: usize,
    pub lease_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub poll_error_backoff_base_ms: u64,
    pub poll_error_backoff_max_ms: u64,
    /// How long a polled row stays reserved before other polls see it again.
    pub reservation_ttl_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_limit: 10,
            workers: 4,
            lease_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            poll_error_backoff_base_ms: 500,
            poll_error_backoff_max_ms: 30_000,
            reservation_ttl_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(invalid("dispatcher.workers must be > 0"));
        }
        if self.poll_limit == 0 {
            return Err(invalid("dispatcher.poll_limit must be > 0"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("dispatcher.heartbeat_interval_ms must be > 0"));
        }
        if self.lease_ms <= self.heartbeat_interval_ms {
            return Err(invalid(
                "dispatcher.lease_ms must be greater than dispatcher.heartbeat_interval_ms",
            ));
        }
        if self.poll_error_backoff_base_ms > self.poll_error_backoff_max_ms {
            return Err(invalid(
                "dispatcher.poll_error_backoff_base_ms must not exceed poll_error_backoff_max_ms",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.reservation_ttl_ms)
    }

    /// Delay before the next poll after `consecutive_errors` failed polls.
    pub fn poll_error_backoff(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(20);
        let ms = self
            .poll_error_backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.poll_error_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
    /// Rows per partition per sweep.
    pub batch_limit: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            batch_limit: 100,
        }
    }
}

impl ReaperConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_limit == 0 {
            return Err(invalid("reaper.batch_limit must be > 0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// `retries_left` of a task enqueued without an explicit value.
    pub default_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.default_retries == 0 {
            return Err(invalid("retry.default_retries must be > 0"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(invalid("retry.jitter_ratio must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Mismatches tolerated before a unit stays `failed` for good.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// A unit `started` longer than this is failed by `fail_stale_started`.
    pub started_timeout_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay_ms: 60_000,
            retry_max_delay_ms: 3_600_000,
            started_timeout_ms: 8 * 3_600_000,
        }
    }
}

impl VerificationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(invalid("verification.max_retries must be > 0"));
        }
        if self.started_timeout_ms == 0 {
            return Err(invalid("verification.started_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn started_timeout(&self) -> Duration {
        Duration::from_millis(self.started_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "partition": {"table": "zoekt_tasks", "scheme": {"type": "hash", "buckets": 8}},
                "dispatcher": {"workers": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(config.partition.table, "zoekt_tasks");
        assert_eq!(config.partition.scheme, PartitionScheme::Hash { buckets: 8 });
        assert_eq!(config.dispatcher.workers, 2);
        assert_eq!(config.dispatcher.poll_limit, 10);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn date_range_scheme_parses() {
        let config = EngineConfig::from_json_str(
            r#"{"partition": {"scheme": {"type": "date_range", "period": "monthly"}, "horizon": 2}}"#,
        )
        .unwrap();
        assert_eq!(
            config.partition.scheme,
            PartitionScheme::DateRange {
                period: DatePeriod::Monthly
            }
        );
    }

    #[rstest]
    #[case(r#"{"partition": {"scheme": {"type": "hash", "buckets": 0}}}"#)]
    #[case(r#"{"partition": {"scheme": {"type": "integer_range", "block_size": 0}}}"#)]
    #[case(r#"{"dispatcher": {"workers": 0}}"#)]
    #[case(r#"{"dispatcher": {"poll_limit": 0}}"#)]
    #[case(r#"{"dispatcher": {"lease_ms": 1000, "heartbeat_interval_ms": 1000}}"#)]
    #[case(r#"{"retry": {"default_retries": 0}}"#)]
    #[case(r#"{"verification": {"max_retries": 0}}"#)]
    #[case(r#"{"partition": {"scheme": {"type": "round_robin"}}}"#)]
    fn invalid_configs_are_rejected(#[case] json: &str) {
        let err = EngineConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn poll_error_backoff_doubles_up_to_cap() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_error_backoff(1), Duration::from_millis(500));
        assert_eq!(config.poll_error_backoff(2), Duration::from_millis(1_000));
        assert_eq!(config.poll_error_backoff(3), Duration::from_millis(2_000));
        assert_eq!(config.poll_error_backoff(30), Duration::from_millis(30_000));
    }
}
