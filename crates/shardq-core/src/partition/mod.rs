//! Partition routing.
//!
//! A [`PartitionRouter`] is built once per process from config and handed to
//! producers and dispatchers; it maps sharding keys to physical partitions and
//! creates partitions ahead of demand through a [`PartitionCatalog`].

mod router;
mod scheme;

pub use router::PartitionRouter;
pub use scheme::{DatePeriod, PartitionScheme, bucket_suffix, bucket_width, hash_bucket};

use async_trait::async_trait;

use crate::domain::PartitionId;
use crate::error::Result;

/// Schema-level partition operations of the storage backend.
///
/// Creation and detach are idempotent. Detached partitions keep their rows
/// readable but are no longer listed or routable.
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    /// Returns `true` when the partition was created by this call.
    async fn create_partition(&self, partition: &PartitionId) -> Result<bool>;

    /// Attached partitions, sorted by name.
    async fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// Detached partitions, sorted by name.
    async fn detached_partitions(&self) -> Result<Vec<PartitionId>>;

    async fn is_attached(&self, partition: &PartitionId) -> Result<bool>;

    async fn is_empty(&self, partition: &PartitionId) -> Result<bool>;

    /// Returns `true` when the partition was attached before this call.
    async fn detach_partition(&self, partition: &PartitionId) -> Result<bool>;
}
