use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::unit::{Checksum, SubjectId, VerifiableUnit, VerificationCounts, VerificationState};
use crate::error::Result;

/// Storage for verifiable units of one content type.
///
/// Mutations other than scheduling and removal are compare-and-swap on
/// `state`.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Creates the unit, or resets an existing one, in `pending`.
    async fn schedule(&self, subject: SubjectId, now: DateTime<Utc>) -> Result<VerifiableUnit>;

    async fn get(&self, subject: SubjectId) -> Result<Option<VerifiableUnit>>;

    /// Writes `unit` if the stored state is still `expected`; otherwise
    /// `VerificationStale`.
    async fn compare_and_set(
        &self,
        expected: VerificationState,
        unit: VerifiableUnit,
    ) -> Result<VerifiableUnit>;

    /// Pending units never started, oldest first.
    async fn pending_never_started(&self, limit: usize) -> Result<Vec<VerifiableUnit>>;

    /// Failed units whose `retry_at` has passed, earliest first.
    async fn failed_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerifiableUnit>>;

    /// Started units whose `started_at` is at or before `cutoff`.
    async fn started_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerifiableUnit>>;

    /// Union of the two work queries: pending first, then failed-due.
    async fn needs_verification(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerifiableUnit>> {
        let mut units = self.pending_never_started(limit).await?;
        let remaining = limit.saturating_sub(units.len());
        if remaining > 0 {
            units.extend(self.failed_due_for_retry(now, remaining).await?);
        }
        Ok(units)
    }

    /// Deletes the unit. Returns whether it existed.
    async fn remove(&self, subject: SubjectId) -> Result<bool>;

    async fn counts(&self) -> Result<VerificationCounts>;
}

/// Source of checksums for a subject (the authoritative primary, or the
/// replica being verified).
#[async_trait]
pub trait ChecksumSource: Send + Sync {
    async fn checksum(&self, subject: SubjectId) -> Result<Checksum>;
}
