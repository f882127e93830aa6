//! Adapters for the ports.
//!
//! In-memory implementations for tests and local runs; a SQL adapter would sit
//! next to these.

pub mod memory_store;

pub use memory_store::InMemoryTaskStore;
