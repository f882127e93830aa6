use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, warn};

use super::store::{ChecksumSource, VerificationStore};
use super::unit::{Checksum, SubjectId, VerifiableUnit, VerificationCounts, VerificationState};
use crate::config::VerificationConfig;
use crate::domain::truncate_detail;
use crate::error::{QueueError, Result};
use crate::lifecycle::{self, RetryPolicy, to_chrono};
use crate::observability::verification_span;
use crate::ports::Clock;

/// Result of comparing a replica checksum with the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumOutcome {
    Verified,
    Mismatch { expected: Checksum, actual: Checksum },
}

/// Drives the verification state machine of one content type.
pub struct Verifier {
    store: Arc<dyn VerificationStore>,
    primary: Arc<dyn ChecksumSource>,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
    retry: RetryPolicy,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        primary: Arc<dyn ChecksumSource>,
        clock: Arc<dyn Clock>,
        config: VerificationConfig,
    ) -> Self {
        let retry = RetryPolicy::new(
            Duration::from_millis(config.retry_base_delay_ms),
            2.0,
            Duration::from_millis(config.retry_max_delay_ms),
        );
        Self {
            store,
            primary,
            clock,
            config,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn VerificationStore> {
        &self.store
    }

    pub async fn get(&self, subject: SubjectId) -> Result<Option<VerifiableUnit>> {
        self.store.get(subject).await
    }

    async fn require(&self, subject: SubjectId) -> Result<VerifiableUnit> {
        self.store
            .get(subject)
            .await?
            .ok_or(QueueError::SubjectNotFound(subject))
    }

    /// Creates or resets the unit to `pending`. Called whenever content changes.
    pub async fn schedule_verification(&self, subject: SubjectId) -> Result<VerifiableUnit> {
        let unit = self.store.schedule(subject, self.clock.now()).await?;
        debug!(subject = %subject, retry_count = unit.retry_count, "verification scheduled");
        Ok(unit)
    }

    /// Pending units never started, then failed units due for a retry.
    pub async fn needs_verification(&self, limit: usize) -> Result<Vec<VerifiableUnit>> {
        self.store.needs_verification(self.clock.now(), limit).await
    }

    /// `pending -> started`.
    pub async fn start(&self, subject: SubjectId) -> Result<VerifiableUnit> {
        let mut unit = self.require(subject).await?;
        if unit.state != VerificationState::Pending {
            return Err(QueueError::VerificationStale {
                subject,
                expected: VerificationState::Pending,
                actual: unit.state,
            });
        }
        let now = self.clock.now();
        unit.state = VerificationState::Started;
        unit.started_at = Some(now);
        unit.updated_at = now;
        self.store
            .compare_and_set(VerificationState::Pending, unit)
            .await
    }

    /// Compares `checksum` with the primary and records the result.
    ///
    /// Match: `started -> verified`, retry count reset. Mismatch:
    /// `started -> failed`, retry count + 1 and a retry scheduled unless the
    /// budget is spent.
    pub async fn record_checksum(
        &self,
        subject: SubjectId,
        checksum: Checksum,
    ) -> Result<ChecksumOutcome> {
        self.compare_checksum(subject, checksum)
            .instrument(verification_span("record_checksum", subject))
            .await
    }

    async fn compare_checksum(
        &self,
        subject: SubjectId,
        checksum: Checksum,
    ) -> Result<ChecksumOutcome> {
        let unit = self.require_started(subject).await?;
        let expected = self.primary.checksum(subject).await?;
        let now = self.clock.now();

        if expected == checksum {
            let mut verified = unit;
            verified.state = VerificationState::Verified;
            verified.checksum = Some(checksum);
            verified.verified_at = Some(now);
            verified.failure = None;
            verified.retry_at = None;
            verified.retry_count = 0;
            verified.updated_at = now;
            self.store
                .compare_and_set(VerificationState::Started, verified)
                .await?;
            info!("verified");
            return Ok(ChecksumOutcome::Verified);
        }

        let message = format!(
            "Checksum does not match the primary checksum (expected {expected}, got {checksum})"
        );
        let mut failed = self.failed(unit, &message);
        failed.checksum = Some(checksum.clone());
        let failed = self
            .store
            .compare_and_set(VerificationState::Started, failed)
            .await?;
        warn!(retry_count = failed.retry_count, retry_at = ?failed.retry_at, "checksum mismatch");
        Ok(ChecksumOutcome::Mismatch {
            expected,
            actual: checksum,
        })
    }

    /// `started -> failed` for reasons other than a mismatch (unreadable
    /// replica, checksum error).
    pub async fn record_failure(&self, subject: SubjectId, message: &str) -> Result<VerifiableUnit> {
        let unit = self.require_started(subject).await?;
        let failed = self.failed(unit, message);
        let failed = self
            .store
            .compare_and_set(VerificationState::Started, failed)
            .await?;
        warn!(subject = %subject, failure = ?failed.failure, "verification failed");
        Ok(failed)
    }

    /// Fails units stuck in `started` longer than the configured timeout.
    pub async fn fail_stale_started(&self) -> Result<usize> {
        let now = self.clock.now();
        let timeout = self.config.started_timeout();
        let cutoff = lifecycle::sub(now, to_chrono(timeout));
        let message = format!("Verification timed out after {} seconds", timeout.as_secs());

        let mut failed = 0;
        for unit in self.store.started_before(cutoff, usize::MAX).await? {
            let subject = unit.subject_id;
            match self
                .store
                .compare_and_set(VerificationState::Started, self.failed(unit, &message))
                .await
            {
                Ok(_) => failed += 1,
                Err(e) if e.is_stale() => debug!(subject = %subject, "unit moved on before timeout"),
                Err(e) => return Err(e),
            }
        }
        if failed > 0 {
            warn!(failed, "timed out stale verifications");
        }
        Ok(failed)
    }

    /// Deletes the unit together with its subject.
    pub async fn remove_subject(&self, subject: SubjectId) -> Result<bool> {
        self.store.remove(subject).await
    }

    pub async fn counts(&self) -> Result<VerificationCounts> {
        self.store.counts().await
    }

    async fn require_started(&self, subject: SubjectId) -> Result<VerifiableUnit> {
        let unit = self.require(subject).await?;
        if unit.state != VerificationState::Started {
            return Err(QueueError::VerificationStale {
                subject,
                expected: VerificationState::Started,
                actual: unit.state,
            });
        }
        Ok(unit)
    }

    fn failed(&self, mut unit: VerifiableUnit, message: &str) -> VerifiableUnit {
        let now = self.clock.now();
        unit.state = VerificationState::Failed;
        unit.failure = Some(truncate_detail(message));
        unit.verified_at = None;
        unit.retry_count += 1;
        unit.retry_at = if unit.retry_count < self.config.max_retries {
            Some(lifecycle::add(
                now,
                to_chrono(self.retry.next_delay(unit.retry_count)),
            ))
        } else {
            None
        };
        unit.updated_at = now;
        unit
    }
}
