//! Application layer: ports wired into producers, dispatch loops and the
//! reaper.
//!
//! - **EngineBuilder / Engine**: wiring and startup validation
//! - **Producer**: enqueue and cancel
//! - **Dispatcher**: poll -> claim -> execute -> record outcome
//! - **LeaseReaper**: recovery of tasks whose lease expired
//! - **StatusQuery**: read-only counts for dashboards
//! - **WorkerGroup**: running loops with graceful shutdown

pub mod builder;
pub mod dependency;
pub mod dispatcher;
pub mod producer;
pub mod reaper;
pub mod status;
pub mod worker_group;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::dependency::{MAX_CHAIN_DEPTH, check_chain};
pub use self::dispatcher::{Dispatcher, PartitionScope};
pub use self::producer::Producer;
pub use self::reaper::LeaseReaper;
pub use self::status::{PartitionStatus, StatusQuery};
pub use self::worker_group::WorkerGroup;
