//! Worker outcomes and failure classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verification::SubjectId;

/// Upper bound for free-text failure details, in characters.
pub const MAX_DETAIL_LEN: usize = 255;

/// Error returned by a handler. `Ok(())` is success.
///
/// - `Recoverable`: consumes one retry, re-queued with backoff
/// - `Fatal`: straight to `failed`
/// - `VerificationMismatch`: straight to `failed`, classified apart from
///   `Fatal` so "data diverged" is not confused with "work broke"
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("recoverable: {0}")]
    Recoverable(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("verification mismatch for subject {subject}: {detail}")]
    VerificationMismatch { subject: SubjectId, detail: String },
}

impl TaskError {
    pub fn recoverable(detail: impl Into<String>) -> Self {
        TaskError::Recoverable(detail.into())
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        TaskError::Fatal(detail.into())
    }

    pub fn class(&self) -> FailureClass {
        match self {
            TaskError::Recoverable(_) => FailureClass::Recoverable,
            TaskError::Fatal(_) => FailureClass::Fatal,
            TaskError::VerificationMismatch { .. } => FailureClass::VerificationMismatch,
        }
    }
}

/// Result of executing one task.
pub type ExecResult = Result<(), TaskError>;

/// Why the last failure happened; stored on the row next to `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Recoverable,
    Fatal,
    VerificationMismatch,
    LeaseExpired,
}

/// Truncates a failure message to [`MAX_DETAIL_LEN`] characters.
pub fn truncate_detail(detail: &str) -> String {
    match detail.char_indices().nth(MAX_DETAIL_LEN) {
        Some((cut, _)) => detail[..cut].to_string(),
        None => detail.to_string(),
    }
}
