use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::scheme::{DatePeriod, PartitionScheme, bucket_suffix, range_suffix};
use super::PartitionCatalog;
use crate::config::PartitionConfig;
use crate::domain::{PartitionId, PartitionKey};
use crate::error::{QueueError, Result};

/// Maps keys to partitions and keeps the partition set ahead of demand.
///
/// Routing fails closed: a key whose partition does not exist (or was
/// detached) is rejected with `PartitionRoutingFailure`, never routed to a
/// neighbouring partition. Partition creation is serialized through an
/// async mutex standing in for the database advisory lock.
pub struct PartitionRouter {
    table: String,
    scheme: PartitionScheme,
    horizon: u32,
    catalog: Arc<dyn PartitionCatalog>,
    creation_lock: Mutex<()>,
}

impl PartitionRouter {
    pub fn new(config: &PartitionConfig, catalog: Arc<dyn PartitionCatalog>) -> Self {
        Self {
            table: config.table.clone(),
            scheme: config.scheme.clone(),
            horizon: config.horizon,
            catalog,
            creation_lock: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    /// Name of the partition that covers `key`, whether or not it exists.
    pub fn partition_for(&self, key: &PartitionKey) -> Result<PartitionId> {
        let suffix = self
            .scheme
            .suffix_for(key)
            .map_err(|reason| QueueError::PartitionRoutingFailure {
                key: key.clone(),
                reason,
            })?;
        Ok(PartitionId::new(&self.table, &suffix))
    }

    /// The attached partition covering `key`.
    pub async fn resolve(&self, key: &PartitionKey) -> Result<PartitionId> {
        let partition = self.partition_for(key)?;
        if self.catalog.is_attached(&partition).await? {
            Ok(partition)
        } else {
            Err(QueueError::PartitionRoutingFailure {
                key: key.clone(),
                reason: format!("partition {partition} does not exist"),
            })
        }
    }

    /// Creates the partition covering `key` if missing.
    ///
    /// A detached partition is not re-created; the key keeps failing to route.
    pub async fn ensure_partition_for(&self, key: &PartitionKey) -> Result<PartitionId> {
        let partition = self.partition_for(key)?;
        {
            let _guard = self.creation_lock.lock().await;
            self.create(&partition).await?;
        }
        if self.catalog.is_attached(&partition).await? {
            Ok(partition)
        } else {
            Err(QueueError::PartitionRoutingFailure {
                key: key.clone(),
                reason: format!("partition {partition} is detached"),
            })
        }
    }

    /// Creates every partition the scheme needs at `now`.
    ///
    /// - hash: all buckets
    /// - date range: the current period and `horizon - 1` periods ahead
    /// - integer range: `horizon` blocks past the highest non-empty block
    ///
    /// Returns the partitions created by this call.
    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<Vec<PartitionId>> {
        let _guard = self.creation_lock.lock().await;
        let wanted = match &self.scheme {
            PartitionScheme::Hash { buckets } => (0..*buckets)
                .map(|bucket| PartitionId::new(&self.table, &bucket_suffix(bucket, *buckets)))
                .collect::<Vec<_>>(),
            PartitionScheme::DateRange { period } => {
                let mut start = period.start_of(now.date_naive());
                let mut wanted = Vec::with_capacity(self.horizon as usize);
                for _ in 0..self.horizon {
                    wanted.push(PartitionId::new(&self.table, &period.suffix(start)));
                    start = period.next(start);
                }
                wanted
            }
            PartitionScheme::IntegerRange { block_size } => {
                let base = self.highest_used_block().await?.unwrap_or(0);
                (0..=i64::from(self.horizon))
                    .filter_map(|k| k.checked_mul(*block_size).and_then(|off| base.checked_add(off)))
                    .map(|lower| PartitionId::new(&self.table, &range_suffix(lower)))
                    .collect()
            }
        };

        let mut created = Vec::new();
        for partition in wanted {
            if self.create(&partition).await? {
                created.push(partition);
            }
        }
        debug!(table = %self.table, created = created.len(), "partition maintenance done");
        Ok(created)
    }

    /// Detaches date-range partitions that end on or before `cutoff`.
    ///
    /// Rows stay readable; new keys in those ranges fail to route.
    pub async fn detach_before(&self, cutoff: NaiveDate) -> Result<Vec<PartitionId>> {
        let PartitionScheme::DateRange { period } = self.scheme else {
            return Err(QueueError::Config(format!(
                "detach_before needs a date_range scheme, table {} uses {}",
                self.table,
                self.scheme.name()
            )));
        };

        let _guard = self.creation_lock.lock().await;
        let mut detached = Vec::new();
        for partition in self.catalog.partitions().await? {
            let Some(start) = self.period_start(period, &partition) else {
                continue;
            };
            if period.next(start) <= cutoff && self.catalog.detach_partition(&partition).await? {
                info!(partition = %partition, %cutoff, "partition detached");
                detached.push(partition);
            }
        }
        Ok(detached)
    }

    async fn create(&self, partition: &PartitionId) -> Result<bool> {
        let created = self.catalog.create_partition(partition).await?;
        if created {
            info!(partition = %partition, scheme = self.scheme.name(), "partition created");
        }
        Ok(created)
    }

    fn period_start(&self, period: DatePeriod, partition: &PartitionId) -> Option<NaiveDate> {
        period.parse_suffix(partition.suffix(&self.table)?)
    }

    async fn highest_used_block(&self) -> Result<Option<i64>> {
        let mut highest = None;
        for partition in self.catalog.partitions().await? {
            let Some(lower) = partition
                .suffix(&self.table)
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            if highest.is_some_and(|h| h >= lower) {
                continue;
            }
            if !self.catalog.is_empty(&partition).await? {
                highest = Some(lower);
            }
        }
        Ok(highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use chrono::TimeZone;

    fn router(config: PartitionConfig) -> (PartitionRouter, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        (PartitionRouter::new(&config, store.clone()), store)
    }

    fn hash_config(buckets: u32) -> PartitionConfig {
        PartitionConfig {
            table: "tasks".into(),
            scheme: PartitionScheme::Hash { buckets },
            horizon: 1,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn resolve_fails_closed_before_maintenance() {
        let (router, _) = router(hash_config(8));
        let err = router.resolve(&PartitionKey::text("ns-42")).await.unwrap_err();
        assert!(matches!(err, QueueError::PartitionRoutingFailure { .. }));
    }

    #[tokio::test]
    async fn hash_maintenance_creates_every_bucket_once() {
        let (router, store) = router(hash_config(16));
        let created = router.maintain(now()).await.unwrap();
        assert_eq!(created.len(), 16);
        assert_eq!(created[0].as_str(), "tasks_00");
        assert_eq!(created[15].as_str(), "tasks_15");
        assert!(router.maintain(now()).await.unwrap().is_empty());
        assert_eq!(store.partitions().await.unwrap().len(), 16);

        let partition = router.resolve(&PartitionKey::text("ns-42")).await.unwrap();
        assert_eq!(
            partition,
            router.resolve(&PartitionKey::text("ns-42")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn ensure_partition_for_is_idempotent() {
        let config = PartitionConfig {
            table: "events".into(),
            scheme: PartitionScheme::IntegerRange { block_size: 1_000 },
            horizon: 2,
        };
        let (router, store) = router(config);
        let key = PartitionKey::Integer(1_500);
        let first = router.ensure_partition_for(&key).await.unwrap();
        let second = router.ensure_partition_for(&key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "events_000000001000");
        assert_eq!(store.partitions().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn date_maintenance_creates_horizon_and_detaches_old() {
        let (router, _) = router(PartitionConfig::daily("checkpoints", 3));
        let created = router.maintain(now()).await.unwrap();
        let names: Vec<_> = created.iter().map(|p| p.as_str().to_string()).collect();
        assert_eq!(
            names,
            ["checkpoints_20240517", "checkpoints_20240518", "checkpoints_20240519"]
        );

        let key = PartitionKey::Date(NaiveDate::from_ymd_opt(2024, 5, 17).unwrap());
        router.resolve(&key).await.unwrap();

        let cutoff = NaiveDate::from_ymd_opt(2024, 5, 18).unwrap();
        let detached = router.detach_before(cutoff).await.unwrap();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].as_str(), "checkpoints_20240517");

        assert!(router.resolve(&key).await.is_err());
        assert!(router.ensure_partition_for(&key).await.is_err());
    }

    #[tokio::test]
    async fn detach_before_requires_date_scheme() {
        let (router, _) = router(hash_config(4));
        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(matches!(
            router.detach_before(cutoff).await,
            Err(QueueError::Config(_))
        ));
    }
}
