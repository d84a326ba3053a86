//! Worker discovery: which mailboxes currently serve an operation.
//!
//! The registry is an eventually consistent hint, not an authority. A key may
//! outlive its worker (crash without cleanup) and a fresh worker may not be
//! listed yet. Callers must tolerate both.

pub mod kv;
pub mod workers;

pub use kv::{KeyValueStore, MemoryKvStore};
pub use workers::{KvWorkerRegistry, WorkerRegistry};

/// Errors from the registry's backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry store unavailable: {0}")]
    Unavailable(String),
}
