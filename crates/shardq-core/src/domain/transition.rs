//! Transition log: one row per state change, never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::partition::PartitionId;
use super::state::TaskState;

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Claimed,
    Heartbeat,
    Completed,
    RetryScheduled,
    RetriesExhausted,
    FatalError,
    VerificationMismatch,
    LeaseExpired,
    Cancelled,
    DependencyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub task_id: TaskId,
    pub partition: PartitionId,
    pub previous_status: TaskState,
    pub next_status: TaskState,
    pub reason: TransitionReason,
    pub attempt: u32,
    pub retries_left: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn pair(&self) -> (TaskState, TaskState) {
        (self.previous_status, self.next_status)
    }
}
