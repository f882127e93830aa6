//! Content verification.
//!
//! Every verifiable subject has one unit tracking whether its replica matches
//! the primary:
//!
//! ```text
//! pending --start--> started --match----> verified
//!    ^                  |
//!    |                  +--mismatch/timeout--> failed (retry_at, retry_count)
//!    +------------ schedule (content changed, retry due) -------+
//! ```
//!
//! The work itself runs as `verify` tasks on the queue: the
//! [`VerificationScheduler`] enqueues them, the [`VerifyHandler`] executes
//! them.

pub mod handler;
pub mod memory;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod unit;

pub use handler::VerifyHandler;
pub use memory::{InMemoryContent, InMemoryVerificationStore};
pub use scheduler::VerificationScheduler;
pub use service::{ChecksumOutcome, Verifier};
pub use store::{ChecksumSource, VerificationStore};
pub use unit::{Checksum, SubjectId, VerifiableUnit, VerificationCounts, VerificationState};
