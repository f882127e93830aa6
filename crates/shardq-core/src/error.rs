//! Engine-level errors.
//!
//! Every error the engine produces is returned to the caller; nothing is
//! swallowed. Worker-side failures live in [`crate::domain::TaskError`] instead,
//! because they drive lifecycle transitions rather than abort an API call.

use std::sync::PoisonError;

use thiserror::Error;

use crate::domain::{PartitionId, PartitionKey, TaskId, TaskState};
use crate::verification::{SubjectId, VerificationState};

/// Result alias used throughout shardq-core.
pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The (partition, natural key) pair is already taken.
    #[error("duplicate task in {partition}: natural_key={natural_key} already used by {existing}")]
    DuplicateTask {
        partition: PartitionId,
        natural_key: String,
        existing: TaskId,
    },

    /// A compare-and-swap lost a race. Re-read and decide again.
    #[error("stale state for {task}: expected {expected}, found {actual}")]
    StaleState {
        task: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("task not found: {task} in {partition}")]
    TaskNotFound { task: TaskId, partition: PartitionId },

    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: TaskState,
        to: TaskState,
        reason: String,
    },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// No partition covers the key. Enqueue fails loudly instead of misrouting.
    #[error("partition routing failed for key {key}: {reason}")]
    PartitionRoutingFailure { key: PartitionKey, reason: String },

    #[error("dependency not found: {task} in {partition}")]
    DependencyNotFound { task: TaskId, partition: PartitionId },

    #[error("dependency cycle: {chain:?}")]
    DependencyCycle { chain: Vec<TaskId> },

    #[error("verifiable unit not found for subject {0}")]
    SubjectNotFound(SubjectId),

    #[error("stale verification state for subject {subject}: expected {expected}, found {actual}")]
    VerificationStale {
        subject: SubjectId,
        expected: VerificationState,
        actual: VerificationState,
    },

    #[error("invalid verification transition for subject {subject}: {from} -> {to}: {reason}")]
    InvalidVerificationTransition {
        subject: SubjectId,
        from: VerificationState,
        to: VerificationState,
        reason: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl QueueError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// True for the expected, retry-after-re-read class of error.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            QueueError::StaleState { .. } | QueueError::VerificationStale { .. }
        )
    }
}

/// Maps a poisoned lock into a storage error.
pub(crate) fn poison_err<T>(_: PoisonError<T>) -> QueueError {
    QueueError::storage("lock poisoned")
}
