//! ChangeSet Resolver: trigger + baseline fingerprints -> ChangeSet.

use std::path::Path;

use tracing::debug;

use crate::domain::{
    AfterburnerError, ChangeSet, ChangeStatus, FileChange, Result, TriggerEvent,
    DELETED_FINGERPRINT,
};
use afterburner_state::{ContentDigest, FingerprintMap};

/// Directories never walked when fingerprinting a repository.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".afterburner",
    "__pycache__",
    ".venv",
    "dist",
];

/// SHA-256 hex of the file at `path`.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(ContentDigest::from_bytes(&bytes).as_str().to_string())
}

/// Fingerprint every regular file under `repo`, skipping `IGNORED_DIRS`.
pub fn fingerprint_repo(repo: &Path) -> Result<FingerprintMap> {
    let mut out = FingerprintMap::new();
    walk(repo, repo, &mut out)?;
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut FingerprintMap) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            let name = entry.file_name();
            if IGNORED_DIRS.iter().any(|d| name == *d) {
                continue;
            }
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            out.insert(relative_path(root, &path), fingerprint_file(&path)?);
        }
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Fingerprint only the listed paths; missing files map to `DELETED_FINGERPRINT`.
pub fn fingerprint_paths(repo: &Path, paths: &[String]) -> Result<FingerprintMap> {
    let mut out = FingerprintMap::new();
    for p in paths {
        let normalized = p.trim_start_matches("./").replace('\\', "/");
        let full = repo.join(&normalized);
        let fp = if full.is_file() {
            fingerprint_file(&full)?
        } else {
            DELETED_FINGERPRINT.to_string()
        };
        out.insert(normalized, fp);
    }
    Ok(out)
}

/// Compute the ChangeSet for `trigger` against `baseline`.
///
/// With no baseline every considered file is returned as Added. An empty
/// result is `AfterburnerError::NoChangesDetected`.
pub fn resolve_changeset(
    trigger: &TriggerEvent,
    baseline: Option<&FingerprintMap>,
) -> Result<ChangeSet> {
    let current = match &trigger.files {
        Some(files) => fingerprint_paths(&trigger.repo_path, files)?,
        None => fingerprint_repo(&trigger.repo_path)?,
    };
    let changeset = diff_fingerprints(&current, baseline, trigger.files.is_none());
    debug!(
        repo = %trigger.repo_path.display(),
        files = changeset.len(),
        has_baseline = baseline.is_some(),
        "resolved changeset"
    );

    if changeset.is_empty() {
        return Err(AfterburnerError::NoChangesDetected {
            repo: trigger.repo_path.display().to_string(),
        });
    }
    Ok(changeset)
}

/// Pure diff of a current fingerprint map against a baseline.
///
/// `full_scan` says `current` covers the whole repository, so baseline
/// entries missing from it are deletions.
pub fn diff_fingerprints(
    current: &FingerprintMap,
    baseline: Option<&FingerprintMap>,
    full_scan: bool,
) -> ChangeSet {
    let Some(baseline) = baseline else {
        return ChangeSet::new(current.iter().map(|(path, fp)| {
            let status = if fp == DELETED_FINGERPRINT {
                ChangeStatus::Deleted
            } else {
                ChangeStatus::Added
            };
            FileChange::new(path.clone(), fp.clone(), status)
        }));
    };

    let mut changes = Vec::new();
    for (path, fp) in current {
        match (baseline.get(path), fp.as_str()) {
            (Some(prev), _) if prev == fp => {}
            (None, DELETED_FINGERPRINT) => {}
            (Some(_), DELETED_FINGERPRINT) => changes.push(FileChange::new(
                path.clone(),
                fp.clone(),
                ChangeStatus::Deleted,
            )),
            (Some(_), _) => changes.push(FileChange::new(
                path.clone(),
                fp.clone(),
                ChangeStatus::Modified,
            )),
            (None, _) => {
                changes.push(FileChange::new(path.clone(), fp.clone(), ChangeStatus::Added))
            }
        }
    }
    if full_scan {
        for path in baseline.keys().filter(|p| !current.contains_key(*p)) {
            changes.push(FileChange::new(
                path.clone(),
                DELETED_FINGERPRINT,
                ChangeStatus::Deleted,
            ));
        }
    }
    ChangeSet::new(changes)
}

/// Re-fingerprint the given paths of `changeset` plus `extra` on disk.
///
/// Used after an opaque fix attempt to learn what it actually touched.
pub fn refresh_changeset(
    repo: &Path,
    changeset: &ChangeSet,
    extra: &[String],
) -> Result<ChangeSet> {
    let mut paths = changeset.paths();
    paths.extend(extra.iter().cloned());
    let fresh = fingerprint_paths(repo, &paths)?;
    Ok(changeset.with_updates(fresh.into_iter().map(|(path, fp)| {
        let status = match changeset.get(&path) {
            _ if fp == DELETED_FINGERPRINT => ChangeStatus::Deleted,
            Some(prev) if prev.status == ChangeStatus::Added => ChangeStatus::Added,
            Some(_) => ChangeStatus::Modified,
            None => ChangeStatus::Modified,
        };
        FileChange::new(path, fp, status)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TriggerEvent;

    fn write(dir: &Path, rel: &str, body: &str) {
        let p = dir.join(rel);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(p, body).unwrap();
    }

    #[test]
    fn no_baseline_returns_full_repository() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/app.py", "print(1)");
        write(dir.path(), "README.md", "hi");
        write(dir.path(), "node_modules/x/index.js", "ignored");
        write(dir.path(), ".git/HEAD", "ref");

        let cs = resolve_changeset(&TriggerEvent::manual(dir.path()), None).unwrap();
        assert_eq!(cs.paths(), vec!["README.md", "src/app.py"]);
        assert!(cs.files().iter().all(|f| f.status == ChangeStatus::Added));
    }

    #[test]
    fn unchanged_repository_is_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "x = 1");
        let baseline = fingerprint_repo(dir.path()).unwrap();

        let err = resolve_changeset(&TriggerEvent::manual(dir.path()), Some(&baseline))
            .unwrap_err();
        assert!(matches!(err, AfterburnerError::NoChangesDetected { .. }));
    }

    #[test]
    fn detects_modified_added_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "keep.py", "1");
        write(dir.path(), "edit.py", "1");
        write(dir.path(), "gone.py", "1");
        let baseline = fingerprint_repo(dir.path()).unwrap();

        write(dir.path(), "edit.py", "2");
        write(dir.path(), "new.py", "1");
        std::fs::remove_file(dir.path().join("gone.py")).unwrap();

        let cs = resolve_changeset(&TriggerEvent::manual(dir.path()), Some(&baseline)).unwrap();
        let statuses: Vec<(String, ChangeStatus)> = cs
            .files()
            .iter()
            .map(|f| (f.path.clone(), f.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("edit.py".to_string(), ChangeStatus::Modified),
                ("gone.py".to_string(), ChangeStatus::Deleted),
                ("new.py".to_string(), ChangeStatus::Added),
            ]
        );
    }

    #[test]
    fn explicit_file_list_restricts_scope() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "auth.py", "password = 'x'");
        write(dir.path(), "other.py", "1");

        let trigger = TriggerEvent::manual(dir.path()).with_files(vec!["./auth.py".into()]);
        let cs = resolve_changeset(&trigger, None).unwrap();
        assert_eq!(cs.paths(), vec!["auth.py"]);
    }

    #[test]
    fn refresh_picks_up_fix_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "1");
        let cs = resolve_changeset(&TriggerEvent::manual(dir.path()), None).unwrap();

        write(dir.path(), "a.py", "2");
        write(dir.path(), "helper.py", "new");
        let refreshed = refresh_changeset(dir.path(), &cs, &["helper.py".into()]).unwrap();

        assert_eq!(cs.delta(&refreshed).paths(), vec!["a.py", "helper.py"]);
    }
}
