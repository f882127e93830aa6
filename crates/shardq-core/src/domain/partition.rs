//! Sharding keys and physical partition names.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The sharding dimension of a task.
///
/// Which variant a router accepts depends on its scheme: hash routing takes
/// `Text` or `Integer`, integer ranges take `Integer`, date ranges take `Date`.
/// The key is immutable once the task is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    /// Namespace/project/bucket style text key, e.g. `ns-42`.
    Text(String),
    /// Numeric key, e.g. a namespace id or a primary-key value.
    Integer(i64),
    /// Date bucket (retention oriented tables).
    Date(NaiveDate),
}

impl PartitionKey {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Bytes fed to the stable hash used by hash partitioning.
    pub(crate) fn hash_input(&self) -> Vec<u8> {
        match self {
            PartitionKey::Text(s) => s.as_bytes().to_vec(),
            PartitionKey::Integer(i) => i.to_be_bytes().to_vec(),
            PartitionKey::Date(d) => d.format("%Y-%m-%d").to_string().into_bytes(),
        }
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for PartitionKey {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<NaiveDate> for PartitionKey {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Text(s) => write!(f, "{s}"),
            PartitionKey::Integer(i) => write!(f, "{i}"),
            PartitionKey::Date(d) => write!(f, "{d}"),
        }
    }
}

/// Name of one physical partition: `{table}_{suffix}`.
///
/// Suffixes are `07` for hash buckets, `202405`/`20240517` for date ranges
/// and the zero-padded lower bound for integer ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(table: &str, suffix: &str) -> Self {
        Self(format!("{table}_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The suffix, if this partition belongs to `table`.
    pub fn suffix(&self, table: &str) -> Option<&str> {
        self.0.strip_prefix(table)?.strip_prefix('_')
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
