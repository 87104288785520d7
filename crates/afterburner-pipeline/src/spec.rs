//! Run specification and identity.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use afterburner_core::config::GatingConfig;
use afterburner_core::{ChangeSet, Result, TriggerKind};

/// What a Run operates on, reduced to the inputs that decide its outcome.
///
/// Two Runs with the same identity saw the same files under the same
/// gating policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    pub repo_path: PathBuf,
    pub trigger: TriggerKind,
    /// ChangeSet fingerprint (SHA-256 over sorted path/fingerprint pairs).
    pub changeset_digest: String,
    /// SHA-256 of the serialized gating configuration.
    pub gating_digest: String,
}

impl RunSpec {
    pub fn new(
        repo_path: PathBuf,
        trigger: TriggerKind,
        changeset: &ChangeSet,
        gating: &GatingConfig,
    ) -> Result<Self> {
        let gating_json = serde_json::to_vec(gating)?;
        Ok(Self {
            repo_path,
            trigger,
            changeset_digest: changeset.fingerprint().as_str().to_string(),
            gating_digest: compute_component_digest(&gating_json),
        })
    }

    /// Deterministic identity digest of this spec.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.repo_path.display().to_string().as_str(),
            self.trigger.to_string().as_str(),
            self.changeset_digest.as_str(),
            self.gating_digest.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

fn compute_component_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
