//! Afterburner-State: persistence layer for pipeline runs
//!
//! This crate owns everything the pipeline must remember across process
//! restarts: the full document of each Run (stages, findings, retry history)
//! and the append-only baseline fingerprint table per repository.
//!
//! ## Key Components
//!
//! - `RunStore`: upsert/load/list of persisted Run documents
//! - `BaselineStore`: append-only baseline table with compare-and-swap commits
//! - `SurrealStateStore`: SurrealDB backend (`mem://` or `surrealkv://`)
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
pub mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    BaselineRecord, BaselineStore, ContentDigest, FingerprintMap, PersistedRun, RunId, RunStore,
    StorageResult,
};
pub use surreal_store::SurrealStateStore;

/// Result type for afterburner-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
