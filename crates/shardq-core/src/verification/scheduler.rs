use std::sync::Arc;

use tracing::{debug, info};

use super::service::Verifier;
use super::unit::{SubjectId, VerifiableUnit, VerificationState};
use crate::app::Producer;
use crate::domain::{NewTask, PartitionKey, TaskPayload};
use crate::error::Result;

type KeyFn = dyn Fn(SubjectId) -> PartitionKey + Send + Sync;

/// Turns units that need verification into `verify` tasks.
///
/// Due failed units are put back to `pending` first. Each task carries a
/// natural key derived from the unit's retry count and last update, so
/// running the scheduler again before the task is picked up enqueues nothing.
pub struct VerificationScheduler {
    verifier: Arc<Verifier>,
    producer: Producer,
    partition_key: Box<KeyFn>,
}

impl VerificationScheduler {
    /// Routes by subject id (`PartitionKey::Integer`).
    pub fn new(verifier: Arc<Verifier>, producer: Producer) -> Self {
        Self::with_partition_key(verifier, producer, subject_key)
    }

    pub fn with_partition_key<F>(verifier: Arc<Verifier>, producer: Producer, key: F) -> Self
    where
        F: Fn(SubjectId) -> PartitionKey + Send + Sync + 'static,
    {
        Self {
            verifier,
            producer,
            partition_key: Box::new(key),
        }
    }

    /// Returns the number of units handed to the queue.
    pub async fn enqueue_due(&self, limit: usize) -> Result<usize> {
        let mut enqueued = 0;
        for unit in self.verifier.needs_verification(limit).await? {
            let unit = match unit.state {
                VerificationState::Failed => {
                    self.verifier.schedule_verification(unit.subject_id).await?
                }
                _ => unit,
            };
            let task = NewTask::new(
                (self.partition_key)(unit.subject_id),
                TaskPayload::verify(unit.subject_id),
            )
            .natural_key(natural_key(&unit));
            let id = self.producer.enqueue(task).await?;
            debug!(subject = %unit.subject_id, task = %id, "verification enqueued");
            enqueued += 1;
        }
        if enqueued > 0 {
            info!(enqueued, "verification tasks enqueued");
        }
        Ok(enqueued)
    }
}

fn subject_key(subject: SubjectId) -> PartitionKey {
    match i64::try_from(subject.0) {
        Ok(id) => PartitionKey::Integer(id),
        Err(_) => PartitionKey::Text(subject.to_string()),
    }
}

fn natural_key(unit: &VerifiableUnit) -> String {
    format!(
        "verify:{}:{}:{}",
        unit.subject_id,
        unit.retry_count,
        unit.updated_at.timestamp_millis()
    )
}
