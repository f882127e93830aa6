//! Task kinds and their payload schemas.
//!
//! The set of kinds is closed: `TaskPayload` is a sum type and the kind is
//! derived from the variant, so a row can never carry a payload that does not
//! match its kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::verification::SubjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Reindex,
    Verify,
    Checkpoint,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Reindex, TaskKind::Verify, TaskKind::Checkpoint];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Reindex => "reindex",
            TaskKind::Verify => "verify",
            TaskKind::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rebuild a search index (or a slice of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexPayload {
    pub index: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_ids: Vec<i64>,
}

/// Confirm a content unit against its authoritative checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyPayload {
    pub subject_id: SubjectId,
}

/// Persist a workflow checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub workflow_id: String,
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Payload of a task, tagged by kind.
///
/// Serialized shape: `{"kind": "verify", "payload": {"subject_id": 7}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    Reindex(ReindexPayload),
    Verify(VerifyPayload),
    Checkpoint(CheckpointPayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Reindex(_) => TaskKind::Reindex,
            TaskPayload::Verify(_) => TaskKind::Verify,
            TaskPayload::Checkpoint(_) => TaskKind::Checkpoint,
        }
    }

    pub fn verify(subject_id: SubjectId) -> Self {
        TaskPayload::Verify(VerifyPayload { subject_id })
    }

    pub fn reindex(index: impl Into<String>) -> Self {
        TaskPayload::Reindex(ReindexPayload {
            index: index.into(),
            document_ids: Vec::new(),
        })
    }

    pub fn checkpoint(workflow_id: impl Into<String>, state: serde_json::Value) -> Self {
        TaskPayload::Checkpoint(CheckpointPayload {
            workflow_id: workflow_id.into(),
            state,
        })
    }
}
