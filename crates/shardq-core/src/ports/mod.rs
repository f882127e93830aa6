//! Ports: the seams between the engine and its collaborators.
//!
//! The relational store is the source of truth; the in-memory adapters in
//! [`crate::impls`] implement the same contracts for tests and local runs.

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{BlockedTask, TaskStore};
