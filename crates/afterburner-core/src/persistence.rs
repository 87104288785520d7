//! Run persistence: `Run` <-> `PersistedRun` over a [`RunStore`].

use std::sync::Arc;

use chrono::Utc;

use crate::domain::{Result, Run, RunStatus};
use afterburner_state::{PersistedRun, RunId, RunStore};

#[derive(Clone)]
pub struct RunRepository {
    store: Arc<dyn RunStore>,
}

impl RunRepository {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, run: &Run) -> Result<()> {
        let persisted = PersistedRun {
            run_id: run.id.clone(),
            repo_path: run.repo_path.display().to_string(),
            status: run.status.as_str().to_string(),
            document: serde_json::to_value(run)?,
            updated_at: Utc::now(),
        };
        self.store.save(persisted).await?;
        Ok(())
    }

    pub async fn load(&self, run_id: &RunId) -> Result<Run> {
        let persisted = self.store.load(run_id).await?;
        decode(persisted)
    }

    /// Runs, most recently updated first, optionally filtered by status.
    pub async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let rows = self.store.list(status.map(RunStatus::as_str)).await?;
        rows.into_iter()
            .map(decode)
            .collect()
    }
}

fn decode(persisted: PersistedRun) -> Result<Run> {
    let run: Run = serde_json::from_value(persisted.document)?;
    run.check_stages()?;
    Ok(run)
}
