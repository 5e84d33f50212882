//! Staging directories.
//!
//! Each case stages into `<root>/<prefix>/`, with a `<root>/<prefix>/<prefix>/`
//! results subdirectory for solvers that write their post files there. The
//! path is a pure function of the prefix, so two cases never share a
//! directory and re-staging the same case is idempotent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::case::sanitize;
use crate::error::{JobError, JobResult};

/// Creates and removes per-case staging directories under a fixed root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory all staging directories live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging path for a case, without touching the filesystem.
    pub fn path_for(&self, case_id: &str) -> JobResult<PathBuf> {
        let prefix = sanitize(case_id);
        if prefix.is_empty() {
            return Err(JobError::StagingFailed {
                path: self.root.clone(),
                reason: format!("case id '{case_id}' has no usable characters"),
            });
        }
        Ok(self.root.join(prefix))
    }

    /// Create the staging directory tree for a case and return its path.
    pub async fn stage(&self, case_id: &str) -> JobResult<PathBuf> {
        let stagedir = self.path_for(case_id)?;
        // Same layout as `RunContext::results_dir`.
        let resultdir = stagedir.join(sanitize(case_id));
        fs::create_dir_all(&resultdir)
            .await
            .map_err(|e| JobError::StagingFailed {
                path: resultdir.clone(),
                reason: e.to_string(),
            })?;
        debug!(path = %stagedir.display(), "staged workspace");
        Ok(stagedir)
    }

    /// Remove a staging directory tree. Missing directories are not an error.
    pub async fn unstage(path: &Path) -> JobResult<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::StagingFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path().join("Scratch"));

        let first = workspace.stage("Steel Bar").await.unwrap();
        assert_eq!(first, root.path().join("Scratch").join("steelbar"));
        assert!(first.join("steelbar").is_dir());

        std::fs::write(first.join("keep.txt"), "x").unwrap();
        let second = workspace.stage("Steel Bar").await.unwrap();
        assert_eq!(first, second);
        assert!(second.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_distinct_cases_get_distinct_dirs() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let a = workspace.stage("beam a").await.unwrap();
        let b = workspace.stage("beam b").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unstage_missing_is_ok() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let path = workspace.stage("beam").await.unwrap();

        Workspace::unstage(&path).await.unwrap();
        assert!(!path.exists());
        Workspace::unstage(&path).await.unwrap();
    }

    #[test]
    fn test_unusable_case_id() {
        let workspace = Workspace::new("/scratch");
        assert!(matches!(
            workspace.path_for("../.."),
            Err(JobError::StagingFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stage_fails_under_a_file() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let workspace = Workspace::new(&blocker);
        assert!(matches!(
            workspace.stage("beam").await,
            Err(JobError::StagingFailed { .. })
        ));
    }
}
