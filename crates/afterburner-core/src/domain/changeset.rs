//! ChangeSet: the file deltas a Run operates on.
//!
//! A ChangeSet is immutable once computed. Fix attempts and reflection
//! produce new ChangeSets (`with_updates`, `delta`) instead of mutating.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use afterburner_state::{ContentDigest, FingerprintMap};

/// Coarse file type derived from the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Python,
    Javascript,
    Typescript,
    Rust,
    Go,
    Java,
    Config,
    Docs,
    Web,
    Docker,
    Other,
}

impl FileKind {
    pub fn from_path(path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_ascii_lowercase();
        if name == "dockerfile" || name.starts_with("docker-compose") {
            return FileKind::Docker;
        }
        let ext = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        match ext {
            "py" => FileKind::Python,
            "js" | "jsx" | "mjs" | "cjs" => FileKind::Javascript,
            "ts" | "tsx" => FileKind::Typescript,
            "rs" => FileKind::Rust,
            "go" => FileKind::Go,
            "java" => FileKind::Java,
            "json" | "yaml" | "yml" | "toml" => FileKind::Config,
            "md" | "txt" => FileKind::Docs,
            "html" | "css" | "scss" => FileKind::Web,
            _ => FileKind::Other,
        }
    }

    pub fn is_source(self) -> bool {
        matches!(
            self,
            FileKind::Python
                | FileKind::Javascript
                | FileKind::Typescript
                | FileKind::Rust
                | FileKind::Go
                | FileKind::Java
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

/// Fingerprint recorded for deleted files.
pub const DELETED_FINGERPRINT: &str = "deleted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative, `/`-separated.
    pub path: String,
    /// SHA-256 hex of the file bytes, or `DELETED_FINGERPRINT`.
    pub fingerprint: String,
    pub kind: FileKind,
    pub status: ChangeStatus,
}

impl FileChange {
    pub fn new(path: impl Into<String>, fingerprint: impl Into<String>, status: ChangeStatus) -> Self {
        let path = path.into();
        let kind = FileKind::from_path(&path);
        Self {
            path,
            fingerprint: fingerprint.into(),
            kind,
            status,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ChangeStatus::Deleted
    }
}

/// Ordered set of changed files, unique by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    files: Vec<FileChange>,
}

impl ChangeSet {
    pub fn new(files: impl IntoIterator<Item = FileChange>) -> Self {
        let by_path: BTreeMap<String, FileChange> =
            files.into_iter().map(|f| (f.path.clone(), f)).collect();
        Self {
            files: by_path.into_values().collect(),
        }
    }

    pub fn files(&self) -> &[FileChange] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Paths that still exist on disk.
    pub fn present_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| !f.is_deleted())
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn has_source_files(&self) -> bool {
        self.files
            .iter()
            .any(|f| !f.is_deleted() && f.kind.is_source())
    }

    pub fn has_kind(&self, kind: FileKind) -> bool {
        self.files.iter().any(|f| !f.is_deleted() && f.kind == kind)
    }

    pub fn fingerprints(&self) -> FingerprintMap {
        self.files
            .iter()
            .map(|f| (f.path.clone(), f.fingerprint.clone()))
            .collect()
    }

    /// Digest over every `(path, fingerprint)` pair.
    pub fn fingerprint(&self) -> ContentDigest {
        ContentDigest::of_fingerprints(&self.fingerprints())
    }

    /// A new ChangeSet with `updates` replacing or adding entries by path.
    pub fn with_updates(&self, updates: impl IntoIterator<Item = FileChange>) -> ChangeSet {
        ChangeSet::new(self.files.iter().cloned().chain(updates))
    }

    /// Files of `next` whose fingerprint is absent from or differs from `self`.
    pub fn delta(&self, next: &ChangeSet) -> ChangeSet {
        ChangeSet::new(
            next.files
                .iter()
                .filter(|f| {
                    self.get(&f.path)
                        .map_or(true, |prev| prev.fingerprint != f.fingerprint)
                })
                .cloned(),
        )
    }

    /// Fold this ChangeSet onto a baseline fingerprint map.
    pub fn apply_to(&self, baseline: &FingerprintMap) -> FingerprintMap {
        let mut out = baseline.clone();
        for f in &self.files {
            if f.is_deleted() {
                out.remove(&f.path);
            } else {
                out.insert(f.path.clone(), f.fingerprint.clone());
            }
        }
        out
    }
}
