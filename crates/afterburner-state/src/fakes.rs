//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRunStore` and `MemoryBaselineStore` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

/// In-memory run store backed by a `HashMap<run_id, PersistedRun>`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, PersistedRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: PersistedRun) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.insert(run.run_id.0.clone(), run);
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> StorageResult<PersistedRun> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.get(&run_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list(&self, status: Option<&str>) -> StorageResult<Vec<PersistedRun>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<PersistedRun> = runs
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MemoryBaselineStore
// ---------------------------------------------------------------------------

/// In-memory baseline table backed by a `HashMap<repo_key, Vec<BaselineRecord>>`.
///
/// The whole compare-and-swap happens under one lock, which is the
/// per-repository exclusive update the contract asks for.
#[derive(Debug, Default)]
pub struct MemoryBaselineStore {
    tables: Mutex<HashMap<String, Vec<BaselineRecord>>>,
}

impl MemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BaselineStore for MemoryBaselineStore {
    async fn current(&self, repo_key: &str) -> StorageResult<Option<BaselineRecord>> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(repo_key).and_then(|rows| rows.last().cloned()))
    }

    async fn compare_and_swap(
        &self,
        repo_key: &str,
        expected: Option<&ContentDigest>,
        fingerprints: FingerprintMap,
        run_id: Option<RunId>,
    ) -> StorageResult<BaselineRecord> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.entry(repo_key.to_string()).or_default();
        check_expected(repo_key, expected, rows.last())?;

        let record = BaselineRecord {
            repo_key: repo_key.to_string(),
            version: rows.last().map_or(1, |b| b.version + 1),
            digest: ContentDigest::of_fingerprints(&fingerprints),
            fingerprints,
            run_id,
            recorded_at: Utc::now(),
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn history(&self, repo_key: &str) -> StorageResult<Vec<BaselineRecord>> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(repo_key).cloned().unwrap_or_default())
    }
}
