//! Read-only operational surface.

use std::sync::Arc;

use serde::Serialize;

use crate::domain::{PartitionId, StateCounts, TaskRecord, TaskRef, TransitionRecord};
use crate::error::Result;
use crate::partition::PartitionCatalog;
use crate::ports::TaskStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    pub partition: PartitionId,
    pub counts: StateCounts,
}

/// Counts and rows for dashboards and alerting. Never mutates.
#[derive(Clone)]
pub struct StatusQuery {
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn PartitionCatalog>,
}

impl StatusQuery {
    pub fn new(store: Arc<dyn TaskStore>, catalog: Arc<dyn PartitionCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Per-partition counts by state, attached partitions only.
    pub async fn partition_counts(&self) -> Result<Vec<PartitionStatus>> {
        let mut statuses = Vec::new();
        for partition in self.catalog.partitions().await? {
            let counts = self.store.counts(&partition).await?;
            statuses.push(PartitionStatus { partition, counts });
        }
        Ok(statuses)
    }

    pub async fn totals(&self) -> Result<StateCounts> {
        let mut totals = StateCounts::default();
        for status in self.partition_counts().await? {
            totals.merge(&status.counts);
        }
        Ok(totals)
    }

    pub async fn task(&self, task: &TaskRef) -> Result<Option<TaskRecord>> {
        self.store.get(task).await
    }

    pub async fn transitions(&self, task: &TaskRef) -> Result<Vec<TransitionRecord>> {
        self.store.transitions(task).await
    }
}
