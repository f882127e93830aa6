//! shardq-core
//!
//! A partitioned background task queue: tasks live in sharded tables, move
//! through a compare-and-swap lifecycle with bounded retries, and are
//! executed by dispatchers polling those partitions.
//!
//! # Modules
//! - **domain**: ids, partition keys, payloads, task rows, states, transitions
//! - **lifecycle**: pure transition functions, retry policy, failure decisions
//! - **partition**: partition schemes, router, catalog port
//! - **ports**: `TaskStore`, `Clock`, `IdGenerator`
//! - **impls**: in-memory store (`TaskStore` + `PartitionCatalog`)
//! - **worker**: `Worker` / `Handler` API and the per-kind registry
//! - **app**: producer, dispatcher, reaper, status, engine wiring
//! - **verification**: checksum verification of replicated content
//! - **config**, **observability**, **error**: ambient plumbing

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod lifecycle;
pub mod observability;
pub mod partition;
pub mod ports;
pub mod verification;
pub mod worker;

pub use app::{Engine, EngineBuilder};
pub use config::EngineConfig;
pub use error::{QueueError, Result};
