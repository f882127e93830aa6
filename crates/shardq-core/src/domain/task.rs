//! Task rows and the values used to create and mutate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;
use super::outcome::FailureClass;
use super::partition::{PartitionId, PartitionKey};
use super::payload::{TaskKind, TaskPayload};
use super::state::TaskState;
use super::transition::TransitionReason;

/// Address of a task row: id plus the partition that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    pub partition: PartitionId,
}

impl TaskRef {
    pub fn new(id: TaskId, partition: PartitionId) -> Self {
        Self { id, partition }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.partition)
    }
}

/// What a producer submits.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub partition_key: PartitionKey,
    pub payload: TaskPayload,
    pub natural_key: Option<String>,
    pub priority: i32,
    pub perform_at: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub depends_on: Option<TaskRef>,
}

impl NewTask {
    pub fn new(partition_key: impl Into<PartitionKey>, payload: TaskPayload) -> Self {
        Self {
            id: None,
            partition_key: partition_key.into(),
            payload,
            natural_key: None,
            priority: 0,
            perform_at: None,
            retries: None,
            depends_on: None,
        }
    }

    /// Caller-assigned id (pre-linked chains). Generated otherwise.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Deduplication key, unique within the partition.
    pub fn natural_key(mut self, key: impl Into<String>) -> Self {
        self.natural_key = Some(key.into());
        self
    }

    /// Lower value runs first among tasks due at the same instant.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn perform_at(mut self, at: DateTime<Utc>) -> Self {
        self.perform_at = Some(at);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn depends_on(mut self, task: TaskRef) -> Self {
        self.depends_on = Some(task);
        self
    }
}

/// A task row.
///
/// Invariant: `retries_left > 0 || state == Failed`.
/// Identity fields (`id`, `partition_key`, `partition`, `payload`,
/// `depends_on`, `created_at`) never change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub partition_key: PartitionKey,
    pub partition: PartitionId,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub natural_key: Option<String>,
    pub priority: i32,
    pub perform_at: DateTime<Utc>,
    pub state: TaskState,
    pub retries_left: u32,

    /// Number of claims so far; fences updates from superseded workers.
    pub attempt: u32,

    pub depends_on: Option<TaskRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.id, self.partition.clone())
    }

    /// Pending and eligible by time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.perform_at <= now
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Running && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// `retries_left > 0 OR (retries_left == 0 AND state == failed)`.
    pub fn satisfies_retry_invariant(&self) -> bool {
        self.retries_left > 0 || self.state == TaskState::Failed
    }

    /// Ordering used by polls: `(perform_at, priority)`, id as tie-breaker.
    pub fn readiness_key(&self) -> (DateTime<Utc>, i32, TaskId) {
        (self.perform_at, self.priority, self.id)
    }
}

/// The mutable part of a row as computed by the lifecycle, applied by the
/// store's compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub state: TaskState,
    pub retries_left: u32,
    pub attempt: u32,
    pub perform_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub reason: TransitionReason,

    /// Free text copied into the transition log.
    pub detail: Option<String>,

    /// When set, the row's `attempt` must equal this value as well.
    pub expected_attempt: Option<u32>,

    pub updated_at: DateTime<Utc>,
}

impl TaskUpdate {
    /// Starts from the current row values.
    pub fn from_record(record: &TaskRecord, reason: TransitionReason, now: DateTime<Utc>) -> Self {
        Self {
            state: record.state,
            retries_left: record.retries_left,
            attempt: record.attempt,
            perform_at: record.perform_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            lease_expires_at: record.lease_expires_at,
            last_error: record.last_error.clone(),
            failure_class: record.failure_class,
            reason,
            detail: None,
            expected_attempt: None,
            updated_at: now,
        }
    }

    pub fn fenced(mut self, attempt: u32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }

    pub fn apply_to(&self, record: &mut TaskRecord) {
        record.state = self.state;
        record.retries_left = self.retries_left;
        record.attempt = self.attempt;
        record.perform_at = self.perform_at;
        record.started_at = self.started_at;
        record.completed_at = self.completed_at;
        record.lease_expires_at = self.lease_expires_at;
        record.last_error = self.last_error.clone();
        record.failure_class = self.failure_class;
        record.updated_at = self.updated_at;
    }
}
