//! Partition schemes: how a key maps to a partition suffix.

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::PartitionKey;

/// Zero padding applied to integer-range lower bounds.
const RANGE_SUFFIX_WIDTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePeriod {
    Daily,
    Monthly,
}

/// Partitioning scheme, fixed when the table is created.
///
/// Serialized as `{"type": "hash", "buckets": 16}`,
/// `{"type": "integer_range", "block_size": 1000000}` or
/// `{"type": "date_range", "period": "daily"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionScheme {
    /// Fixed bucket count, never rebalanced.
    Hash { buckets: u32 },
    /// One partition per `block_size` consecutive non-negative integers.
    IntegerRange { block_size: i64 },
    /// One partition per day or month.
    DateRange { period: DatePeriod },
}

/// Stable bucket of a key: first eight bytes of its SHA-256 digest, modulo
/// the bucket count.
pub fn hash_bucket(key: &PartitionKey, buckets: u32) -> u32 {
    let digest = Sha256::digest(key.hash_input());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(buckets.max(1))) as u32
}

/// Suffix width for hash buckets: digit count of the highest bucket index.
pub fn bucket_width(buckets: u32) -> usize {
    buckets.saturating_sub(1).max(1).to_string().len()
}

pub fn bucket_suffix(bucket: u32, buckets: u32) -> String {
    format!("{bucket:0width$}", width = bucket_width(buckets))
}

pub fn range_suffix(lower_bound: i64) -> String {
    format!("{lower_bound:0width$}", width = RANGE_SUFFIX_WIDTH)
}

impl DatePeriod {
    /// First day of the period containing `day`.
    pub fn start_of(self, day: NaiveDate) -> NaiveDate {
        match self {
            DatePeriod::Daily => day,
            DatePeriod::Monthly => day.with_day(1).unwrap_or(day),
        }
    }

    /// First day of the following period.
    pub fn next(self, start: NaiveDate) -> NaiveDate {
        match self {
            DatePeriod::Daily => start + Duration::days(1),
            DatePeriod::Monthly => start
                .checked_add_months(Months::new(1))
                .unwrap_or(NaiveDate::MAX),
        }
    }

    pub fn suffix(self, start: NaiveDate) -> String {
        match self {
            DatePeriod::Daily => start.format("%Y%m%d").to_string(),
            DatePeriod::Monthly => start.format("%Y%m").to_string(),
        }
    }

    /// Inverse of [`DatePeriod::suffix`].
    pub fn parse_suffix(self, suffix: &str) -> Option<NaiveDate> {
        match self {
            DatePeriod::Daily => NaiveDate::parse_from_str(suffix, "%Y%m%d").ok(),
            DatePeriod::Monthly => NaiveDate::parse_from_str(&format!("{suffix}01"), "%Y%m%d").ok(),
        }
    }
}

impl PartitionScheme {
    /// Suffix of the partition covering `key`, or why the key cannot be
    /// routed by this scheme.
    pub fn suffix_for(&self, key: &PartitionKey) -> Result<String, String> {
        match (self, key) {
            (PartitionScheme::Hash { buckets }, PartitionKey::Text(_) | PartitionKey::Integer(_)) => {
                Ok(bucket_suffix(hash_bucket(key, *buckets), *buckets))
            }
            (PartitionScheme::IntegerRange { block_size }, PartitionKey::Integer(value)) => {
                if *value < 0 {
                    return Err(format!("negative key {value} is outside every range"));
                }
                Ok(range_suffix(value - value.rem_euclid(*block_size)))
            }
            (PartitionScheme::DateRange { period }, PartitionKey::Date(day)) => {
                Ok(period.suffix(period.start_of(*day)))
            }
            (scheme, key) => Err(format!("{} key cannot be routed by {}", key_type(key), scheme.name())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PartitionScheme::Hash { .. } => "hash",
            PartitionScheme::IntegerRange { .. } => "integer_range",
            PartitionScheme::DateRange { .. } => "date_range",
        }
    }
}

fn key_type(key: &PartitionKey) -> &'static str {
    match key {
        PartitionKey::Text(_) => "text",
        PartitionKey::Integer(_) => "integer",
        PartitionKey::Date(_) => "date",
    }
}
