//! SurrealDB schema migrations and initialization
//!
//! Sets up the two Afterburner tables with their indexes. Uniqueness that
//! the pipeline relies on (one document per run, one row per baseline
//! version) is enforced here rather than in application code.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Afterburner tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Afterburner SurrealDB schema");

    init_pipeline_runs_table(db).await?;
    init_baselines_table(db).await?;

    info!("Afterburner schema initialization complete");
    Ok(())
}

/// Initialize `pipeline_runs` table
///
/// Schema:
/// ```text
/// TABLE pipeline_runs {
///   run_id:      STRING (unique)
///   repo_path:   STRING (indexed)
///   status:      STRING (indexed)
///   document:    STRING (JSON-encoded Run)
///   updated_at:  DATETIME (indexed)
/// }
/// ```
async fn init_pipeline_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pipeline_runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS pipeline_runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE pipeline_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_repo_path ON TABLE pipeline_runs COLUMNS repo_path;
        DEFINE INDEX IF NOT EXISTS idx_status ON TABLE pipeline_runs COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_updated_at ON TABLE pipeline_runs COLUMNS updated_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    info!("✓ pipeline_runs table initialized");
    Ok(())
}

/// Initialize `baselines` table
///
/// Schema:
/// ```text
/// TABLE baselines {
///   repo_key:      STRING
///   version:       INT (1-indexed, per repo)
///   digest:        STRING
///   fingerprints:  STRING (JSON-encoded path -> fingerprint map)
///   run_id:        STRING?
///   recorded_at:   DATETIME
/// }
/// ```
///
/// Constraints:
/// - `(repo_key, version)` is unique: two writers racing from the same
///   baseline both try to insert `version + 1` and one of them fails
/// - rows are append-only (update/delete denied)
async fn init_baselines_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing baselines table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS baselines AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_repo_version ON TABLE baselines COLUMNS repo_key, version UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_repo_key ON TABLE baselines COLUMNS repo_key;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    info!("✓ baselines table initialized");
    Ok(())
}
