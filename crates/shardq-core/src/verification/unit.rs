//! Verifiable units and their state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Id of the content a unit verifies (blob, repository snapshot, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub u64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Verification state.
///
/// - Pending -> Started (start)
/// - Started -> Verified | Failed (checksum recorded, failure, timeout)
/// - any -> Pending (schedule / reschedule)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending,
    Started,
    Verified,
    Failed,
}

impl VerificationState {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Started => "started",
            VerificationState::Verified => "verified",
            VerificationState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, target: VerificationState) -> bool {
        use VerificationState::*;
        matches!(
            (self, target),
            (_, Pending) | (Pending, Started) | (Started, Verified) | (Started, Failed)
        )
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary content digest; serialized as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Checksum(Vec<u8>);

impl Checksum {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// SHA-256 of `content`.
    pub fn sha256(content: &[u8]) -> Self {
        Self(Sha256::digest(content).to_vec())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(hex_str).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Verification row, one per subject.
///
/// Invariants: `verified_at` is set only in `Verified`; `failure` is set only
/// in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiableUnit {
    pub subject_id: SubjectId,
    pub state: VerificationState,
    pub checksum: Option<Checksum>,
    pub retry_count: u32,
    /// Next retry for a failed unit; `None` once retries are exhausted.
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VerifiableUnit {
    pub fn pending(subject_id: SubjectId, now: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            state: VerificationState::Pending,
            checksum: None,
            retry_count: 0,
            retry_at: None,
            started_at: None,
            verified_at: None,
            failure: None,
            updated_at: now,
        }
    }

    /// Moves back to pending, keeping the checksum and retry count.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.state = VerificationState::Pending;
        self.retry_at = None;
        self.started_at = None;
        self.verified_at = None;
        self.failure = None;
        self.updated_at = now;
    }

    pub fn satisfies_invariants(&self) -> bool {
        let verified_ok = self.verified_at.is_none() || self.state == VerificationState::Verified;
        let failure_ok = self.failure.is_none() || self.state == VerificationState::Failed;
        verified_ok && failure_ok
    }

    pub fn is_pending_never_started(&self) -> bool {
        self.state == VerificationState::Pending && self.started_at.is_none()
    }

    pub fn is_failed_due(&self, now: DateTime<Utc>) -> bool {
        self.state == VerificationState::Failed && self.retry_at.is_some_and(|at| at <= now)
    }

    pub fn needs_verification(&self, now: DateTime<Utc>) -> bool {
        self.is_pending_never_started() || self.is_failed_due(now)
    }
}

/// Per-state unit counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCounts {
    pub pending: usize,
    pub started: usize,
    pub verified: usize,
    pub failed: usize,
}

impl VerificationCounts {
    pub fn record(&mut self, state: VerificationState) {
        match state {
            VerificationState::Pending => self.pending += 1,
            VerificationState::Started => self.started += 1,
            VerificationState::Verified => self.verified += 1,
            VerificationState::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[rstest]
    #[case(VerificationState::Pending, VerificationState::Started, true)]
    #[case(VerificationState::Started, VerificationState::Verified, true)]
    #[case(VerificationState::Started, VerificationState::Failed, true)]
    #[case(VerificationState::Verified, VerificationState::Pending, true)]
    #[case(VerificationState::Failed, VerificationState::Pending, true)]
    #[case(VerificationState::Pending, VerificationState::Verified, false)]
    #[case(VerificationState::Verified, VerificationState::Failed, false)]
    #[case(VerificationState::Failed, VerificationState::Started, false)]
    fn verification_edges(
        #[case] from: VerificationState,
        #[case] to: VerificationState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn checksum_hex_round_trip() {
        let sum = Checksum::sha256(b"hello");
        assert_eq!(
            sum.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let json = serde_json::to_string(&sum).unwrap();
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sum);
    }

    #[test]
    fn query_shapes_are_disjoint() {
        let t = now();
        let pending = VerifiableUnit::pending(SubjectId(1), t);
        assert!(pending.is_pending_never_started());
        assert!(!pending.is_failed_due(t));

        let mut failed = VerifiableUnit::pending(SubjectId(2), t);
        failed.state = VerificationState::Failed;
        failed.failure = Some("mismatch".into());
        failed.retry_at = Some(t + Duration::minutes(1));
        assert!(!failed.is_pending_never_started());
        assert!(!failed.is_failed_due(t));
        assert!(failed.is_failed_due(t + Duration::minutes(1)));

        failed.retry_at = None;
        assert!(!failed.needs_verification(t + Duration::days(1)));
    }

    #[test]
    fn reset_clears_outcome_fields() {
        let t = now();
        let mut unit = VerifiableUnit::pending(SubjectId(1), t);
        unit.state = VerificationState::Verified;
        unit.verified_at = Some(t);
        unit.retry_count = 2;
        unit.reset(t);
        assert!(unit.satisfies_invariants());
        assert_eq!(unit.state, VerificationState::Pending);
        assert_eq!(unit.retry_count, 2);
    }
}
