//! TaskStore port: the source of truth for task rows.
//!
//! # Design rules
//! - Every mutation is a single-row compare-and-swap (`update_state`); there
//!   is no blind "set state".
//! - No operation spans two partitions in one critical section.
//! - Every state change appends one [`TransitionRecord`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    DispatcherId, PartitionId, StateCounts, TaskId, TaskRecord, TaskRef, TaskState, TaskUpdate,
    TransitionRecord,
};
use crate::error::Result;

/// A pending task whose dependency can no longer succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedTask {
    pub task: TaskRecord,
    /// `None` when the dependency row no longer exists.
    pub dependency_state: Option<TaskState>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new row.
    ///
    /// Fails with `DuplicateTask` when `(partition, natural_key)` is taken and
    /// with `PartitionRoutingFailure` when the partition is not attached.
    async fn insert(&self, task: TaskRecord) -> Result<TaskId>;

    async fn get(&self, task: &TaskRef) -> Result<Option<TaskRecord>>;

    async fn find_by_natural_key(
        &self,
        partition: &PartitionId,
        natural_key: &str,
    ) -> Result<Option<TaskRecord>>;

    /// Compare-and-swap on `state` (and `attempt`, when the update is fenced).
    ///
    /// Returns the row as written, or `StaleState` if the row moved on.
    async fn update_state(
        &self,
        task: &TaskRef,
        expected: TaskState,
        update: TaskUpdate,
    ) -> Result<TaskRecord>;

    /// Up to `limit` due, claimable rows of one partition ordered by
    /// `(perform_at, priority, id)`.
    ///
    /// Returned rows are reserved for `dispatcher` for a short time; other
    /// polls skip them until the reservation is claimed, released or expires.
    /// Rows whose dependency has not succeeded are skipped.
    async fn poll(
        &self,
        partition: &PartitionId,
        dispatcher: DispatcherId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>>;

    /// Drops a reservation taken by `poll` without claiming.
    async fn release(&self, task: &TaskRef, dispatcher: DispatcherId) -> Result<()>;

    /// Running rows whose lease deadline has passed.
    async fn expired_leases(
        &self,
        partition: &PartitionId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>>;

    /// Pending rows whose dependency ended in `failed`/`cancelled` or vanished.
    async fn blocked_by_dependency(
        &self,
        partition: &PartitionId,
        limit: usize,
    ) -> Result<Vec<BlockedTask>>;

    async fn counts(&self, partition: &PartitionId) -> Result<StateCounts>;

    /// Transition log of one task, oldest first.
    async fn transitions(&self, task: &TaskRef) -> Result<Vec<TransitionRecord>>;
}
