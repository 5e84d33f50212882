//! Job lifecycle types.
//!
//! The job state machine:
//!
//! ```text
//!                ┌──────── ready() / clean() ─────────────────────────┐
//!                ▼                                                    │
//!   Unsubmitted ──submit()──→ Submitted ──→ Active ──→ Running ──→ Completed
//!        │                       │            │          │       ├─→ Failed
//!        └──(submit error)──→ Failed          │          │       └─→ Unknown
//!                                └────────────┴──kill()──┴──→ Terminated
//! ```
//!
//! **Invariants:**
//! - `handle.is_some()` implies the job was submitted at least once; it says
//!   nothing about whether the process is still alive.
//! - Within one submission attempt, status only moves forward. Only
//!   `ready()`/`clean()` move a job back to `Unsubmitted`.
//! - `Submitted`, `Active` and `Running` jobs cannot be resubmitted, edited,
//!   cleaned or destroyed.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{JobError, JobResult};
use crate::launcher::LaunchMode;

/// Hard upper bound for cores per machine and machine count.
pub const RESOURCE_LIMIT: u32 = 16;

/// Identifier of the simulation case a job belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create a new job ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque execution handle: a scheduler job id or a local process-group id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl JobHandle {
    /// Create a handle, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    /// Handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Never submitted, or reset.
    #[default]
    Unsubmitted,
    /// Accepted by the launcher, not yet confirmed running.
    Submitted,
    /// Queued, held or waiting under a scheduler.
    Active,
    /// Executing.
    Running,
    /// Finished with a clean log and the expected result artifact.
    Completed,
    /// Failed to submit, or finished without evidence of success.
    Failed,
    /// Termination was requested.
    Terminated,
    /// The status query returned something that could not be classified.
    Unknown,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Unsubmitted,
        JobStatus::Submitted,
        JobStatus::Active,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Terminated,
        JobStatus::Unknown,
    ];

    /// Submitted or waiting under a scheduler.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Active)
    }

    /// Actually executing.
    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running)
    }

    /// Terminal for the current submission attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Terminated
        )
    }

    /// Parameters may be edited.
    pub fn is_editable(&self) -> bool {
        !self.is_active() && !self.is_running()
    }

    /// The owning case may be deleted.
    pub fn is_destroyable(&self) -> bool {
        !self.is_active() && !self.is_running()
    }

    /// The staging directory may be removed.
    pub fn is_cleanable(&self) -> bool {
        !self.is_active() && !self.is_running() && *self != JobStatus::Unsubmitted
    }

    /// A termination signal may be sent.
    pub fn is_terminatable(&self) -> bool {
        self.is_active() || self.is_running()
    }

    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unsubmitted => "Unsubmitted",
            JobStatus::Submitted => "Submitted",
            JobStatus::Active => "Active",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Terminated => "Terminated",
            JobStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute resources requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Processes per machine.
    pub cores: u32,
    /// Number of machines.
    pub machines: u32,
}

impl Resources {
    /// Validate against a platform maximum (`max_cores`, `max_machines`).
    pub fn new(cores: u32, machines: u32, max_cores: u32, max_machines: u32) -> JobResult<Self> {
        let max_cores = max_cores.min(RESOURCE_LIMIT);
        let max_machines = max_machines.min(RESOURCE_LIMIT);
        if cores == 0 || cores > max_cores {
            return Err(JobError::InvalidResources(format!(
                "cores must be 1..={max_cores}, got {cores}"
            )));
        }
        if machines == 0 || machines > max_machines {
            return Err(JobError::InvalidResources(format!(
                "machines must be 1..={max_machines}, got {machines}"
            )));
        }
        Ok(Self { cores, machines })
    }

    /// Single process on a single machine.
    pub fn serial() -> Self {
        Self {
            cores: 1,
            machines: 1,
        }
    }

    /// Total process count.
    pub fn total_processes(&self) -> u32 {
        self.cores * self.machines
    }

    /// Whether the solver runs under MPI.
    pub fn is_parallel(&self) -> bool {
        self.cores > 1
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::serial()
    }
}

/// One execution attempt of a simulation case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Case identifier.
    pub id: JobId,
    /// Sanitized file/directory prefix derived from the case name.
    pub prefix: String,
    /// Execution handle, `None` until submitted or after a reset.
    pub handle: Option<JobHandle>,
    /// Staging directory, `None` until submitted or after a reset. May no
    /// longer exist on disk.
    pub workdir: Option<PathBuf>,
    /// Current status.
    pub status: JobStatus,
    /// How the current attempt was launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_mode: Option<LaunchMode>,
    /// Number of submissions so far.
    #[serde(default)]
    pub attempts: u32,
    /// When the current attempt was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    backend: BackendKind,
    resources: Resources,
}

impl Job {
    /// Create an unsubmitted job.
    pub fn new(
        id: impl Into<JobId>,
        prefix: impl Into<String>,
        backend: BackendKind,
        resources: Resources,
    ) -> Self {
        Self {
            id: id.into(),
            prefix: prefix.into(),
            handle: None,
            workdir: None,
            status: JobStatus::Unsubmitted,
            launch_mode: None,
            attempts: 0,
            submitted_at: None,
            updated_at: Utc::now(),
            backend,
            resources,
        }
    }

    /// Solver backend for this job.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Requested resources.
    pub fn resources(&self) -> Resources {
        self.resources
    }

    /// Change the backend. Rejected once the job has been submitted.
    pub fn set_backend(&mut self, backend: BackendKind) -> JobResult<()> {
        if self.attempts > 0 {
            return Err(JobError::BackendLocked);
        }
        self.backend = backend;
        Ok(())
    }

    /// Change the requested resources. Rejected unless editable.
    pub fn set_resources(&mut self, resources: Resources) -> JobResult<()> {
        if !self.is_editable() {
            return Err(JobError::illegal("edit", self.status));
        }
        self.resources = resources;
        Ok(())
    }

    pub fn is_editable(&self) -> bool {
        self.status.is_editable()
    }

    pub fn is_destroyable(&self) -> bool {
        self.status.is_destroyable()
    }

    pub fn is_cleanable(&self) -> bool {
        self.status.is_cleanable()
    }

    pub fn is_terminatable(&self) -> bool {
        self.status.is_terminatable()
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Clear the handle and workdir and return to `Unsubmitted`.
    pub(crate) fn reset(&mut self) {
        self.handle = None;
        self.workdir = None;
        self.launch_mode = None;
        self.submitted_at = None;
        self.set_status(JobStatus::Unsubmitted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_predicates() {
        use JobStatus::*;

        for status in [Submitted, Active, Running] {
            assert!(!status.is_editable(), "{status}");
            assert!(!status.is_destroyable(), "{status}");
            assert!(!status.is_cleanable(), "{status}");
            assert!(status.is_terminatable(), "{status}");
        }
        for status in [Completed, Failed, Terminated, Unknown] {
            assert!(status.is_editable(), "{status}");
            assert!(status.is_cleanable(), "{status}");
            assert!(!status.is_terminatable(), "{status}");
        }
        assert!(Unsubmitted.is_editable());
        assert!(Unsubmitted.is_destroyable());
        assert!(!Unsubmitted.is_cleanable());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Terminated.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_status_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            JobStatus::ALL.iter().map(|status| status.as_str()).collect();
        assert_eq!(names.len(), JobStatus::ALL.len());
        assert_eq!(JobStatus::Running.to_string(), "Running");
    }

    #[test]
    fn test_job_id_conversions() {
        let owned = JobId::from(String::from("steelbar1"));
        assert_eq!(owned, JobId::from("steelbar1"));
        assert_eq!(owned, JobId::new("steelbar1"));
        assert_eq!(owned.to_string(), "steelbar1");
    }

    #[test]
    fn test_handle_is_trimmed() {
        let handle = JobHandle::new("  4242.pbs-server\n");
        assert_eq!(handle.as_str(), "4242.pbs-server");
    }

    #[test]
    fn test_resources_bounds() {
        assert!(Resources::new(4, 2, 8, 2).is_ok());
        assert!(matches!(
            Resources::new(0, 1, 8, 1),
            Err(JobError::InvalidResources(_))
        ));
        assert!(Resources::new(9, 1, 8, 1).is_err());
        assert!(Resources::new(1, 3, 8, 2).is_err());
        // Configured maxima above the hard limit are clamped.
        assert!(Resources::new(17, 1, 64, 1).is_err());
    }

    #[test]
    fn test_backend_locked_after_submit() {
        let mut job = Job::new("beam-1", "beam1", BackendKind::Elmer, Resources::serial());
        job.set_backend(BackendKind::Ansys).unwrap();
        assert_eq!(job.backend(), BackendKind::Ansys);

        job.attempts = 1;
        assert!(matches!(
            job.set_backend(BackendKind::Elmer),
            Err(JobError::BackendLocked)
        ));
    }

    #[test]
    fn test_resources_locked_while_running() {
        let mut job = Job::new("beam-1", "beam1", BackendKind::Elmer, Resources::serial());
        job.set_status(JobStatus::Running);
        let err = job
            .set_resources(Resources { cores: 2, machines: 1 })
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(job.resources(), Resources::serial());
    }

    #[test]
    fn test_reset_clears_attempt_state() {
        let mut job = Job::new("beam-1", "beam1", BackendKind::Elmer, Resources::serial());
        job.handle = Some(JobHandle::new("1234"));
        job.workdir = Some(PathBuf::from("/tmp/beam1"));
        job.set_status(JobStatus::Failed);

        job.reset();
        assert_eq!(job.status, JobStatus::Unsubmitted);
        assert!(job.handle.is_none());
        assert!(job.workdir.is_none());
    }
}
