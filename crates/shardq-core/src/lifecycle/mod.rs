//! Lifecycle state machine.
//!
//! Pure functions from `(row, event, now)` to the `TaskUpdate` the store
//! should compare-and-swap in. Nothing here touches storage, so every edge
//! and every invariant can be checked without a store.
//!
//! ```text
//! pending --claim--> running --complete--> succeeded
//!    |                 |  ^ heartbeat
//!    |                 |--fail(recoverable, retries remain)--> pending
//!    |                 |--fail(fatal | mismatch | exhausted)--> failed
//!    |--cancel--> cancelled
//! ```

mod decision;
mod retry;

pub use decision::{Decider, Decision, DefaultDecider};
pub use retry::RetryPolicy;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    FailureClass, TaskError, TaskRecord, TaskState, TaskUpdate, TransitionReason, truncate_detail,
};
use crate::error::{QueueError, Result};

/// Converts a config/backoff duration, saturating on overflow.
pub(crate) fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

/// `now + by`, clamped to the latest representable instant.
pub(crate) fn add(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - by`, clamped to the earliest representable instant.
pub(crate) fn sub(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn require_state(task: &TaskRecord, state: TaskState, to: TaskState) -> Result<()> {
    if task.state != state {
        return Err(QueueError::InvalidTransition {
            from: task.state,
            to,
            reason: format!("task {} is {}, not {}", task.id, task.state, state),
        });
    }
    Ok(())
}

/// Worker-side updates must come from the attempt that currently holds the
/// lease.
fn require_attempt(task: &TaskRecord, attempt: u32) -> Result<()> {
    if task.state != TaskState::Running || task.attempt != attempt {
        return Err(QueueError::StaleState {
            task: task.id,
            expected: TaskState::Running,
            actual: task.state,
        });
    }
    Ok(())
}

/// `retries_left > 0 OR (retries_left == 0 AND state == failed)`.
pub fn check_invariant(task: &TaskRecord) -> Result<()> {
    if task.satisfies_retry_invariant() {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            from: task.state,
            to: task.state,
            reason: format!("task {} is {} with zero retries left", task.id, task.state),
        })
    }
}

/// `pending -> running`. Starts a new attempt and a lease.
///
/// Dependency readiness is checked by the store's poll, not here.
pub fn claim(task: &TaskRecord, now: DateTime<Utc>, lease: Duration) -> Result<TaskUpdate> {
    require_state(task, TaskState::Pending, TaskState::Running)?;
    check_invariant(task)?;
    let mut update = TaskUpdate::from_record(task, TransitionReason::Claimed, now).fenced(task.attempt);
    update.state = TaskState::Running;
    update.attempt = task.attempt + 1;
    update.started_at = Some(now);
    update.lease_expires_at = Some(add(now, lease));
    Ok(update)
}

/// `running -> running`: pushes the lease deadline out.
pub fn heartbeat(
    task: &TaskRecord,
    attempt: u32,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<TaskUpdate> {
    require_attempt(task, attempt)?;
    let mut update = TaskUpdate::from_record(task, TransitionReason::Heartbeat, now).fenced(attempt);
    update.lease_expires_at = Some(add(now, lease));
    Ok(update)
}

/// `running -> succeeded`.
pub fn complete(task: &TaskRecord, attempt: u32, now: DateTime<Utc>) -> Result<TaskUpdate> {
    require_attempt(task, attempt)?;
    let mut update = TaskUpdate::from_record(task, TransitionReason::Completed, now).fenced(attempt);
    update.state = TaskState::Succeeded;
    update.completed_at = Some(now);
    update.lease_expires_at = None;
    Ok(update)
}

/// `running -> pending | failed`, as decided by `decider`.
pub fn fail(
    task: &TaskRecord,
    attempt: u32,
    error: &TaskError,
    decider: &dyn Decider,
    now: DateTime<Utc>,
) -> Result<TaskUpdate> {
    require_attempt(task, attempt)?;
    let class = error.class();
    let decision = decider.decide(task, class);
    Ok(apply_decision(task, decision, class, &error.to_string(), now).fenced(attempt))
}

/// Lease expired without heartbeat: treated as a recoverable failure.
pub fn reap_expired(
    task: &TaskRecord,
    decider: &dyn Decider,
    now: DateTime<Utc>,
) -> Result<TaskUpdate> {
    if !task.is_lease_expired(now) {
        return Err(QueueError::InvalidTransition {
            from: task.state,
            to: TaskState::Pending,
            reason: format!("lease of {} has not expired", task.id),
        });
    }
    let detail = format!("lease expired during attempt {}", task.attempt);
    let decision = decider.decide(task, FailureClass::LeaseExpired);
    Ok(apply_decision(task, decision, FailureClass::LeaseExpired, &detail, now).fenced(task.attempt))
}

/// `pending -> cancelled`. Running tasks are never interrupted.
pub fn cancel(
    task: &TaskRecord,
    reason: TransitionReason,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TaskUpdate> {
    require_state(task, TaskState::Pending, TaskState::Cancelled)?;
    let mut update = TaskUpdate::from_record(task, reason, now).fenced(task.attempt);
    update.state = TaskState::Cancelled;
    update.completed_at = Some(now);
    if let Some(detail) = detail {
        let detail = truncate_detail(detail);
        update.last_error = Some(detail.clone());
        update.detail = Some(detail);
    }
    Ok(update)
}

fn apply_decision(
    task: &TaskRecord,
    decision: Decision,
    class: FailureClass,
    detail: &str,
    now: DateTime<Utc>,
) -> TaskUpdate {
    let detail = truncate_detail(detail);
    let reason = match &decision {
        Decision::Retry { .. } => TransitionReason::RetryScheduled,
        Decision::Fail { reason, .. } => *reason,
    };
    let mut update = TaskUpdate::from_record(task, reason, now);
    update.lease_expires_at = None;
    update.last_error = Some(detail.clone());
    update.failure_class = Some(class);
    update.detail = Some(detail);
    match decision {
        Decision::Retry {
            delay,
            retries_left,
        } => {
            update.state = TaskState::Pending;
            update.retries_left = retries_left;
            update.perform_at = add(now, to_chrono(delay));
        }
        Decision::Fail { retries_left, .. } => {
            update.state = TaskState::Failed;
            update.retries_left = retries_left;
            update.completed_at = Some(now);
        }
    }
    update
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, TimeZone, Utc};

    use crate::domain::{
        PartitionId, PartitionKey, TaskId, TaskPayload, TaskRecord, TaskState,
    };

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    pub fn pending(retries_left: u32) -> TaskRecord {
        TaskRecord {
            id: TaskId::from_u128(1),
            partition_key: PartitionKey::text("ns-42"),
            partition: PartitionId::new("tasks", "0"),
            kind: crate::domain::TaskKind::Verify,
            payload: TaskPayload::verify(crate::verification::SubjectId(42)),
            natural_key: None,
            priority: 0,
            perform_at: t0(),
            state: TaskState::Pending,
            retries_left,
            attempt: 0,
            depends_on: None,
            created_at: t0(),
            started_at: None,
            completed_at: None,
            lease_expires_at: None,
            last_error: None,
            failure_class: None,
            updated_at: t0(),
        }
    }
}
