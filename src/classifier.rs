//! Completion classifier.
//!
//! Once a launcher reports that a pipeline is no longer executing, the only
//! evidence left is on disk:
//!
//! 1. no captured log → `Failed` (nothing ever ran)
//! 2. error markers in the log → `Failed`, even if results exist
//! 3. primary result artifact present → `Completed`, otherwise `Failed`
//!
//! A clean log with a missing artifact is a silent truncation and counts as a
//! failure. Nothing is ever resolved to `Completed` by default.

use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use crate::backend::SolverBackend;
use crate::job::JobStatus;

/// Why a finished run was classified as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    MissingLog,
    ErrorMarkers,
    MissingArtifact,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureCause::MissingLog => "captured log does not exist",
            FailureCause::ErrorMarkers => "captured log contains error markers",
            FailureCause::MissingArtifact => "primary result artifact is missing",
        })
    }
}

/// Outcome of classifying a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Completed,
    Failed(FailureCause),
}

impl Verdict {
    pub fn status(&self) -> JobStatus {
        match self {
            Verdict::Completed => JobStatus::Completed,
            Verdict::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Decide between `Completed` and `Failed` from the captured log and the
/// backend's primary artifact.
pub async fn classify(backend: &dyn SolverBackend, stdout_log: &Path, artifact: &Path) -> Verdict {
    let verdict = if !exists(stdout_log).await {
        Verdict::Failed(FailureCause::MissingLog)
    } else if !backend.is_output_healthy(stdout_log).await {
        Verdict::Failed(FailureCause::ErrorMarkers)
    } else if exists(artifact).await {
        Verdict::Completed
    } else {
        Verdict::Failed(FailureCause::MissingArtifact)
    };

    match verdict {
        Verdict::Completed => debug!(log = %stdout_log.display(), "run verified complete"),
        Verdict::Failed(cause) => info!(
            backend = %backend.kind(),
            log = %stdout_log.display(),
            %cause,
            "run classified as failed"
        ),
    }
    verdict
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    struct Fixture {
        _dir: tempfile::TempDir,
        log: std::path::PathBuf,
        artifact: std::path::PathBuf,
    }

    fn fixture(log: Option<&str>, artifact: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("beam.out");
        let artifact_path = dir.path().join("beam0001.vtu");
        if let Some(text) = log {
            std::fs::write(&log_path, text).unwrap();
        }
        if artifact {
            std::fs::write(&artifact_path, "<VTKFile/>").unwrap();
        }
        Fixture {
            _dir: dir,
            log: log_path,
            artifact: artifact_path,
        }
    }

    async fn run(log: Option<&str>, artifact: bool) -> Verdict {
        let f = fixture(log, artifact);
        classify(&FakeBackend::default(), &f.log, &f.artifact).await
    }

    #[tokio::test]
    async fn test_clean_log_and_artifact_completes() {
        assert_eq!(run(Some("solve ok\n"), true).await, Verdict::Completed);
    }

    #[tokio::test]
    async fn test_clean_log_missing_artifact_fails() {
        assert_eq!(
            run(Some("solve ok\n"), false).await,
            Verdict::Failed(FailureCause::MissingArtifact)
        );
    }

    #[tokio::test]
    async fn test_dirty_log_wins_over_artifact() {
        for artifact in [true, false] {
            assert_eq!(
                run(Some("ERROR: singular matrix\n"), artifact).await,
                Verdict::Failed(FailureCause::ErrorMarkers)
            );
        }
    }

    #[tokio::test]
    async fn test_missing_log_fails() {
        for artifact in [true, false] {
            assert_eq!(
                run(None, artifact).await,
                Verdict::Failed(FailureCause::MissingLog)
            );
        }
    }

    #[test]
    fn test_verdict_status() {
        assert_eq!(Verdict::Completed.status(), JobStatus::Completed);
        assert_eq!(
            Verdict::Failed(FailureCause::MissingArtifact).status(),
            JobStatus::Failed
        );
    }
}
