//! Storage trait definitions for Afterburner
//!
//! These traits define the two persistence concerns of the pipeline:
//! - `RunStore`: the full Run document, keyed by run id
//! - `BaselineStore`: the append-only baseline fingerprint table, keyed by repository
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// File path (repository-relative) to content fingerprint.
pub type FingerprintMap = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of a fingerprint map. Order-independent because the map is sorted.
    pub fn of_fingerprints(fingerprints: &FingerprintMap) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        for (path, fingerprint) in fingerprints {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(fingerprint.as_bytes());
            hasher.update(b"\n");
        }
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunStore: Run document persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// A Run as stored: a handful of indexed columns plus the full JSON document.
///
/// The document is opaque to this crate; `afterburner-core` owns its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRun {
    pub run_id: RunId,
    pub repo_path: String,
    /// Lowercase run status, e.g. "active", "pending_external", "blocked".
    pub status: String,
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Run document persistence.
///
/// Guarantees:
/// - `save` is an upsert keyed by `run_id`; the latest save wins.
/// - `load` returns exactly the last saved document or `RunNotFound`.
/// - `list` returns most recently updated first.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace the stored document for `run.run_id`.
    async fn save(&self, run: PersistedRun) -> StorageResult<()>;

    /// Load a run by id.
    async fn load(&self, run_id: &RunId) -> StorageResult<PersistedRun>;

    /// List runs, optionally filtered by status.
    async fn list(&self, status: Option<&str>) -> StorageResult<Vec<PersistedRun>>;
}

// ---------------------------------------------------------------------------
// BaselineStore: append-only baseline fingerprint table
// ---------------------------------------------------------------------------

/// One committed baseline for a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub repo_key: String,
    /// 1-indexed, strictly increasing per repository.
    pub version: u64,
    pub digest: ContentDigest,
    pub fingerprints: FingerprintMap,
    /// Run that committed this baseline, if any.
    pub run_id: Option<RunId>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only baseline table.
///
/// Guarantees:
/// - Rows are never updated in place; each commit appends `version + 1`.
/// - `compare_and_swap` succeeds only if the current digest equals `expected`
///   (`None` meaning "no baseline yet"); otherwise `StorageError::StaleBaseline`.
/// - `history` returns oldest first.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Latest baseline for the repository, if one was ever committed.
    async fn current(&self, repo_key: &str) -> StorageResult<Option<BaselineRecord>>;

    /// Append a new baseline if the current one still matches `expected`.
    async fn compare_and_swap(
        &self,
        repo_key: &str,
        expected: Option<&ContentDigest>,
        fingerprints: FingerprintMap,
        run_id: Option<RunId>,
    ) -> StorageResult<BaselineRecord>;

    /// Every baseline committed for the repository.
    async fn history(&self, repo_key: &str) -> StorageResult<Vec<BaselineRecord>>;
}

/// Check a CAS precondition against the current row. Shared by backends.
pub fn check_expected(
    repo_key: &str,
    expected: Option<&ContentDigest>,
    current: Option<&BaselineRecord>,
) -> StorageResult<()> {
    let actual = current.map(|b| &b.digest);
    if actual != expected {
        return Err(StorageError::StaleBaseline {
            repo: repo_key.to_string(),
            expected: expected.map(|d| d.as_str().to_string()),
            actual: actual.map(|d| d.as_str().to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_digest_is_order_independent() {
        let mut a = FingerprintMap::new();
        a.insert("b.py".into(), "2".into());
        a.insert("a.py".into(), "1".into());
        let mut b = FingerprintMap::new();
        b.insert("a.py".into(), "1".into());
        b.insert("b.py".into(), "2".into());
        assert_eq!(
            ContentDigest::of_fingerprints(&a),
            ContentDigest::of_fingerprints(&b)
        );
    }

    #[test]
    fn fingerprint_digest_distinguishes_path_boundaries() {
        let mut a = FingerprintMap::new();
        a.insert("ab".into(), "c".into());
        let mut b = FingerprintMap::new();
        b.insert("a".into(), "bc".into());
        assert_ne!(
            ContentDigest::of_fingerprints(&a),
            ContentDigest::of_fingerprints(&b)
        );
    }

    #[test]
    fn digest_rejects_non_hex() {
        let err = ContentDigest::try_from("zz".repeat(32)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn check_expected_accepts_matching_none() {
        assert!(check_expected("repo", None, None).is_ok());
    }
}
