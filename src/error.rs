//! Job error types.
//!
//! Errors are categorized by what the caller should do next:
//!
//! | Category | Variants | Effect on the job | Recovery |
//! |----------|----------|-------------------|----------|
//! | **Submit-fatal** | `StagingFailed`, `MaterializationFailed`, `LaunchFailed` | status set to `Failed` | Inspect workdir, fix, resubmit |
//! | **Transient** | `PollTransient`, `Timeout` | status unchanged | Retry the poll |
//! | **Rejected** | `IllegalTransition`, `BackendLocked`, `InvalidResources` | nothing mutated | Fix the request |
//! | **Infrastructure** | `Command`, `Persistence`, `Configuration` | depends on the operation | Fix the environment |

use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobStatus;

/// Errors that can occur while driving a simulation job.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    // ── Submit-fatal errors ──────────────────────────────────────────
    /// The staging directory could not be created or accessed.
    #[error("Staging failed at '{}': {reason}", path.display())]
    StagingFailed {
        /// Directory that could not be staged.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// A solver artifact could not be written.
    #[error("Failed to write '{}': {source}", path.display())]
    MaterializationFailed {
        /// Artifact that failed to materialize.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The scheduler or the local spawn did not return a usable handle.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    // ── Transient errors (retry) ─────────────────────────────────────
    /// The status query did not return data.
    #[error("Status query failed: {0}")]
    PollTransient(String),

    /// An external command exceeded its time budget.
    #[error("Timed out running {0}")]
    Timeout(String),

    // ── Rejected requests ────────────────────────────────────────────
    /// The operation is not legal from the job's current status.
    #[error("Cannot {operation} a job that is {status}")]
    IllegalTransition {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Status the job was in.
        status: JobStatus,
    },

    /// The backend cannot change after the first submission.
    #[error("Backend is fixed once a job has been submitted")]
    BackendLocked,

    /// Requested cores/machines are outside the platform bounds.
    #[error("Invalid resources: {0}")]
    InvalidResources(String),

    // ── Infrastructure errors ────────────────────────────────────────
    /// An external program could not be started.
    #[error("Could not run '{program}': {source}")]
    Command {
        /// Program that failed to start.
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The job store failed to load or save a record.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl JobError {
    /// Returns `true` if the operation may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PollTransient(_) | Self::Timeout(_))
    }

    /// Returns `true` if the request was refused without mutating the job.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::IllegalTransition { .. } | Self::BackendLocked | Self::InvalidResources(_)
        )
    }

    pub(crate) fn illegal(operation: &'static str, status: JobStatus) -> Self {
        Self::IllegalTransition { operation, status }
    }
}

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(JobError::PollTransient("qstat exited 2".into()).is_transient());
        assert!(JobError::Timeout("qstat".into()).is_transient());
        assert!(!JobError::LaunchFailed("empty job id".into()).is_transient());
        assert!(!JobError::BackendLocked.is_transient());
    }

    #[test]
    fn test_rejections() {
        assert!(JobError::illegal("submit", JobStatus::Running).is_rejection());
        assert!(JobError::InvalidResources("cores".into()).is_rejection());
        assert!(!JobError::Persistence("disk full".into()).is_rejection());
    }

    #[test]
    fn test_error_display() {
        let err = JobError::illegal("kill", JobStatus::Completed);
        assert_eq!(err.to_string(), "Cannot kill a job that is Completed");

        let err = JobError::StagingFailed {
            path: PathBuf::from("/scratch/beam"),
            reason: "no home directory".into(),
        };
        assert_eq!(
            err.to_string(),
            "Staging failed at '/scratch/beam': no home directory"
        );
    }
}
