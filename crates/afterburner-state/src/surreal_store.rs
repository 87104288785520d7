//! SurrealDB-backed `RunStore` and `BaselineStore`
//!
//! Rows are private to this module and converted to/from `storage_traits`
//! types at the boundary. JSON payloads are stored as strings so that
//! path-like map keys survive the round trip untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::{
    check_expected, BaselineRecord, BaselineStore, ContentDigest, FingerprintMap, PersistedRun,
    RunId, RunStore, StorageResult,
};

const NAMESPACE: &str = "afterburner";
const DATABASE: &str = "main";

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    run_id: String,
    repo_path: String,
    status: String,
    document: String,
    #[serde(with = "surreal_datetime")]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BaselineRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    repo_key: String,
    version: u64,
    digest: String,
    fingerprints: String,
    run_id: Option<String>,
    #[serde(with = "surreal_datetime")]
    recorded_at: DateTime<Utc>,
}

/// SurrealDB implementation of both storage traits.
pub struct SurrealStateStore {
    db: Surreal<Any>,
    // Serialises compare-and-swap within this process; the unique
    // (repo_key, version) index covers writers in other processes.
    cas_lock: Mutex<()>,
}

impl SurrealStateStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealStateStore connected ({})", url);
        Ok(Self {
            db,
            cas_lock: Mutex::new(()),
        })
    }

    /// Create from environment.
    ///
    /// Uses `AFTERBURNER_DB_URL` when set, otherwise local persistence under
    /// `<state_dir>/db`.
    pub async fn from_env(state_dir: &std::path::Path) -> crate::Result<Self> {
        if let Ok(url) = std::env::var("AFTERBURNER_DB_URL") {
            return Self::connect(&url).await;
        }

        let path = state_dir.join("db");
        std::fs::create_dir_all(&path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        info!("AFTERBURNER_DB_URL not set, using local persistence: {}", url);
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_run(&self, rid: &str) -> StorageResult<Option<RunRow>> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM pipeline_runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    fn row_to_run(row: RunRow) -> StorageResult<PersistedRun> {
        Ok(PersistedRun {
            run_id: RunId(row.run_id),
            repo_path: row.repo_path,
            status: row.status,
            document: serde_json::from_str(&row.document)?,
            updated_at: row.updated_at,
        })
    }

    fn row_to_baseline(row: BaselineRow) -> StorageResult<BaselineRecord> {
        let fingerprints: FingerprintMap = serde_json::from_str(&row.fingerprints)?;
        Ok(BaselineRecord {
            repo_key: row.repo_key,
            version: row.version,
            digest: ContentDigest::try_from(row.digest)?,
            fingerprints,
            run_id: row.run_id.map(RunId),
            recorded_at: row.recorded_at,
        })
    }
}

#[async_trait]
impl RunStore for SurrealStateStore {
    async fn save(&self, run: PersistedRun) -> StorageResult<()> {
        let document = serde_json::to_string(&run.document)?;

        if self.fetch_run(&run.run_id.0).await?.is_some() {
            debug!(run_id = %run.run_id, status = %run.status, "updating run");
            self.db
                .query(
                    "UPDATE pipeline_runs SET repo_path = $repo, status = $status, \
                     document = $doc, updated_at = $ts WHERE run_id = $rid",
                )
                .bind(("repo", run.repo_path))
                .bind(("status", run.status))
                .bind(("doc", document))
                .bind(("ts", surrealdb::sql::Datetime::from(run.updated_at)))
                .bind(("rid", run.run_id.0))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
                .check()
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            return Ok(());
        }

        debug!(run_id = %run.run_id, status = %run.status, "creating run");
        let row = RunRow {
            id: None,
            run_id: run.run_id.0,
            repo_path: run.repo_path,
            status: run.status,
            document,
            updated_at: run.updated_at,
        };
        let _created: Option<RunRow> = self
            .db
            .create("pipeline_runs")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> StorageResult<PersistedRun> {
        let row = self
            .fetch_run(&run_id.0)
            .await?
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        Self::row_to_run(row)
    }

    async fn list(&self, status: Option<&str>) -> StorageResult<Vec<PersistedRun>> {
        let rows: Vec<RunRow> = if let Some(status) = status {
            let status_owned = status.to_string();
            let mut res = self
                .db
                .query("SELECT * FROM pipeline_runs WHERE status = $status ORDER BY updated_at DESC")
                .bind(("status", status_owned))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM pipeline_runs ORDER BY updated_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(Self::row_to_run).collect()
    }
}

#[async_trait]
impl BaselineStore for SurrealStateStore {
    async fn current(&self, repo_key: &str) -> StorageResult<Option<BaselineRecord>> {
        let repo_owned = repo_key.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM baselines WHERE repo_key = $repo ORDER BY version DESC LIMIT 1")
            .bind(("repo", repo_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BaselineRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().next().map(Self::row_to_baseline).transpose()
    }

    async fn compare_and_swap(
        &self,
        repo_key: &str,
        expected: Option<&ContentDigest>,
        fingerprints: FingerprintMap,
        run_id: Option<RunId>,
    ) -> StorageResult<BaselineRecord> {
        let _guard = self.cas_lock.lock().await;

        let current = self.current(repo_key).await?;
        check_expected(repo_key, expected, current.as_ref())?;

        let record = BaselineRecord {
            repo_key: repo_key.to_string(),
            version: current.as_ref().map_or(1, |b| b.version + 1),
            digest: ContentDigest::of_fingerprints(&fingerprints),
            fingerprints,
            run_id,
            recorded_at: Utc::now(),
        };
        let row = BaselineRow {
            id: None,
            repo_key: record.repo_key.clone(),
            version: record.version,
            digest: record.digest.as_str().to_string(),
            fingerprints: serde_json::to_string(&record.fingerprints)?,
            run_id: record.run_id.as_ref().map(|r| r.0.clone()),
            recorded_at: record.recorded_at,
        };

        let created: StorageResult<Option<BaselineRow>> = self
            .db
            .create("baselines")
            .content(row)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("already contains") {
                    // Another process committed the same version first.
                    StorageError::StaleBaseline {
                        repo: repo_key.to_string(),
                        expected: expected.map(|d| d.as_str().to_string()),
                        actual: None,
                    }
                } else {
                    StorageError::Backend(msg)
                }
            });
        created?;

        debug!(repo = %repo_key, version = record.version, "baseline committed");
        Ok(record)
    }

    async fn history(&self, repo_key: &str) -> StorageResult<Vec<BaselineRecord>> {
        let repo_owned = repo_key.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM baselines WHERE repo_key = $repo ORDER BY version ASC")
            .bind(("repo", repo_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BaselineRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(Self::row_to_baseline).collect()
    }
}
