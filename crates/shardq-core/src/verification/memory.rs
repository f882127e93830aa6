//! In-memory verification adapters.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{ChecksumSource, VerificationStore};
use super::unit::{Checksum, SubjectId, VerifiableUnit, VerificationCounts, VerificationState};
use crate::error::{QueueError, Result, poison_err};

#[derive(Default)]
pub struct InMemoryVerificationStore {
    units: RwLock<BTreeMap<SubjectId, VerifiableUnit>>,
}

impl InMemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn select(
        &self,
        limit: usize,
        filter: impl Fn(&VerifiableUnit) -> bool,
        order: impl Fn(&VerifiableUnit, &VerifiableUnit) -> std::cmp::Ordering,
    ) -> Result<Vec<VerifiableUnit>> {
        let units = self.units.read().map_err(poison_err)?;
        let mut selected: Vec<VerifiableUnit> =
            units.values().filter(|u| filter(u)).cloned().collect();
        selected.sort_by(|a, b| order(a, b));
        selected.truncate(limit);
        Ok(selected)
    }
}

#[async_trait]
impl VerificationStore for InMemoryVerificationStore {
    async fn schedule(&self, subject: SubjectId, now: DateTime<Utc>) -> Result<VerifiableUnit> {
        let mut units = self.units.write().map_err(poison_err)?;
        let unit = units
            .entry(subject)
            .and_modify(|unit| unit.reset(now))
            .or_insert_with(|| VerifiableUnit::pending(subject, now));
        Ok(unit.clone())
    }

    async fn get(&self, subject: SubjectId) -> Result<Option<VerifiableUnit>> {
        let units = self.units.read().map_err(poison_err)?;
        Ok(units.get(&subject).cloned())
    }

    async fn compare_and_set(
        &self,
        expected: VerificationState,
        unit: VerifiableUnit,
    ) -> Result<VerifiableUnit> {
        let mut units = self.units.write().map_err(poison_err)?;
        let current = units
            .get_mut(&unit.subject_id)
            .ok_or(QueueError::SubjectNotFound(unit.subject_id))?;
        if current.state != expected {
            return Err(QueueError::VerificationStale {
                subject: unit.subject_id,
                expected,
                actual: current.state,
            });
        }
        let reason = if !expected.can_transition_to(unit.state) {
            Some("edge not in the state graph")
        } else if !unit.satisfies_invariants() {
            Some("outcome fields do not match the state")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(QueueError::InvalidVerificationTransition {
                subject: unit.subject_id,
                from: expected,
                to: unit.state,
                reason: reason.to_string(),
            });
        }
        *current = unit.clone();
        Ok(unit)
    }

    async fn pending_never_started(&self, limit: usize) -> Result<Vec<VerifiableUnit>> {
        self.select(
            limit,
            VerifiableUnit::is_pending_never_started,
            |a, b| (a.updated_at, a.subject_id).cmp(&(b.updated_at, b.subject_id)),
        )
    }

    async fn failed_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerifiableUnit>> {
        self.select(
            limit,
            |u| u.is_failed_due(now),
            |a, b| (a.retry_at, a.subject_id).cmp(&(b.retry_at, b.subject_id)),
        )
    }

    async fn started_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerifiableUnit>> {
        self.select(
            limit,
            |u| {
                u.state == VerificationState::Started && u.started_at.is_some_and(|at| at <= cutoff)
            },
            |a, b| (a.started_at, a.subject_id).cmp(&(b.started_at, b.subject_id)),
        )
    }

    async fn remove(&self, subject: SubjectId) -> Result<bool> {
        let mut units = self.units.write().map_err(poison_err)?;
        Ok(units.remove(&subject).is_some())
    }

    async fn counts(&self) -> Result<VerificationCounts> {
        let units = self.units.read().map_err(poison_err)?;
        let mut counts = VerificationCounts::default();
        for unit in units.values() {
            counts.record(unit.state);
        }
        Ok(counts)
    }
}

/// Content held in memory; checksums are SHA-256 of the bytes.
#[derive(Default)]
pub struct InMemoryContent {
    blobs: RwLock<HashMap<SubjectId, Vec<u8>>>,
}

impl InMemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, subject: SubjectId, content: impl Into<Vec<u8>>) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(poison_err)?;
        blobs.insert(subject, content.into());
        Ok(())
    }

    pub fn remove(&self, subject: SubjectId) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(poison_err)?;
        blobs.remove(&subject);
        Ok(())
    }
}

#[async_trait]
impl ChecksumSource for InMemoryContent {
    async fn checksum(&self, subject: SubjectId) -> Result<Checksum> {
        let blobs = self.blobs.read().map_err(poison_err)?;
        blobs
            .get(&subject)
            .map(|content| Checksum::sha256(content))
            .ok_or(QueueError::SubjectNotFound(subject))
    }
}
