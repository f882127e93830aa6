//! Domain model (ids, partition keys, payloads, states, rows, outcomes).

pub mod ids;
pub mod outcome;
pub mod partition;
pub mod payload;
pub mod state;
pub mod task;
pub mod transition;

pub use ids::{DispatcherId, Id, IdMarker, TaskId};
pub use outcome::{ExecResult, FailureClass, MAX_DETAIL_LEN, TaskError, truncate_detail};
pub use partition::{PartitionId, PartitionKey};
pub use payload::{CheckpointPayload, ReindexPayload, TaskKind, TaskPayload, VerifyPayload};
pub use state::{StateCounts, TaskState};
pub use task::{NewTask, TaskRecord, TaskRef, TaskUpdate};
pub use transition::{TransitionReason, TransitionRecord};
