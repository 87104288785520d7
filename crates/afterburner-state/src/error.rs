//! Error types for afterburner-state

use thiserror::Error;

/// Errors raised while connecting to or initialising the state backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits
#[derive(Error, Debug)]
pub enum StorageError {
    /// No persisted run with this id
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The digest string is not 64 hex characters
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// The baseline moved since the run started
    #[error(
        "stale baseline for {repo}: expected {}, found {}",
        or_none(.expected),
        or_none(.actual)
    )]
    StaleBaseline {
        repo: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Encoding or decoding a stored document failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

fn or_none(digest: &Option<String>) -> &str {
    digest.as_deref().unwrap_or("<none>")
}
