use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::service::{ChecksumOutcome, Verifier};
use super::store::ChecksumSource;
use super::unit::VerificationState;
use crate::domain::{ExecResult, TaskError, VerifyPayload};
use crate::error::QueueError;
use crate::worker::{Handler, TaskContext};

/// Runs `verify` tasks: reads the replica checksum and records it against the
/// primary.
///
/// A mismatch fails the task as `VerificationMismatch` (no task-level retry;
/// the unit's own retry schedule takes over). An unreadable replica is
/// recoverable.
pub struct VerifyHandler {
    verifier: Arc<Verifier>,
    replica: Arc<dyn ChecksumSource>,
}

impl VerifyHandler {
    pub fn new(verifier: Arc<Verifier>, replica: Arc<dyn ChecksumSource>) -> Self {
        Self { verifier, replica }
    }
}

fn fatal(e: QueueError) -> TaskError {
    TaskError::fatal(e.to_string())
}

#[async_trait]
impl Handler<VerifyPayload> for VerifyHandler {
    async fn handle(&self, payload: &VerifyPayload, ctx: &TaskContext) -> ExecResult {
        let subject = payload.subject_id;
        let unit = self
            .verifier
            .get(subject)
            .await
            .map_err(fatal)?
            .ok_or_else(|| fatal(QueueError::SubjectNotFound(subject)))?;

        match unit.state {
            VerificationState::Pending => {
                self.verifier.start(subject).await.map_err(fatal)?;
            }
            // a previous attempt started it and then lost its lease
            VerificationState::Started => {
                debug!(subject = %subject, attempt = ctx.attempt, "resuming started verification");
            }
            state => {
                return Err(TaskError::fatal(format!(
                    "subject {subject} is {state}, nothing to verify"
                )));
            }
        }

        let checksum = match self.replica.checksum(subject).await {
            Ok(checksum) => checksum,
            Err(e) => return Err(TaskError::recoverable(format!("replica read failed: {e}"))),
        };

        match self.verifier.record_checksum(subject, checksum).await {
            Ok(ChecksumOutcome::Verified) => Ok(()),
            Ok(ChecksumOutcome::Mismatch { expected, actual }) => {
                Err(TaskError::VerificationMismatch {
                    subject,
                    detail: format!("expected {expected}, got {actual}"),
                })
            }
            Err(e @ QueueError::Storage { .. }) => Err(TaskError::recoverable(e.to_string())),
            Err(e) => Err(fatal(e)),
        }
    }
}
