//! Launch strategies.
//!
//! A [`Launcher`] starts a written launch script and later answers "what is
//! it doing now?" for the handle it returned:
//!
//! ```text
//!   directives() ──→ submit() ──→ poll() ──→ kill()
//!      (sync)         (async)     (async)    (async)
//! ```
//!
//! | Strategy | Handle | `poll()` evidence | `kill()` |
//! |----------|--------|-------------------|----------|
//! | [`SchedulerLauncher`] | PBS job id | `qstat -x` job state | `qdel` |
//! | [`LocalLauncher`] | process-group id | live processes in the group | `SIGTERM` to the group |
//!
//! `poll()` never decides between `Completed` and `Failed`; it reports
//! [`Probe::Finished`] and leaves that to the completion classifier.

mod command;
mod local;
mod process;
mod scheduler;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{PipelineShape, RunContext};
use crate::error::JobResult;
use crate::job::JobHandle;

pub use command::{CommandOutput, CommandRunner, Invocation, SystemCommandRunner};
pub use local::LocalLauncher;
pub use process::{PgrepTable, ProcessTable, default_process_table};
#[cfg(target_os = "linux")]
pub use process::ProcfsTable;
pub use scheduler::{SchedulerLauncher, map_pbs_state, parse_job_state};

/// How a job is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaunchMode {
    /// Detached process group on this machine.
    #[default]
    #[serde(rename = "local")]
    Local,
    /// PBS/Torque batch scheduler.
    #[serde(rename = "pbs")]
    Scheduler,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Local => write!(f, "local"),
            LaunchMode::Scheduler => write!(f, "pbs"),
        }
    }
}

/// What a launcher observed about a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Waiting to run (queued, held, exiting, ...).
    Active,
    /// Executing.
    Running,
    /// Only the launch shell is left; may be wrapping up.
    Settling,
    /// No longer executing; outcome must be classified from evidence.
    Finished,
    /// The scheduler reported a state outside the known table.
    Unrecognized(String),
}

/// Starts, observes and stops launch scripts.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Which mode this launcher implements.
    fn mode(&self) -> LaunchMode;

    /// Header lines inserted after the shebang of the launch script.
    fn directives(&self, _ctx: &RunContext) -> Vec<String> {
        Vec::new()
    }

    /// Start the script and return its handle.
    async fn submit(&self, script: &Path, ctx: &RunContext) -> JobResult<JobHandle>;

    /// Observe the handle. Errors are transient: the caller keeps the stored
    /// status and retries later.
    async fn poll(&self, handle: &JobHandle, shape: PipelineShape) -> JobResult<Probe>;

    /// Request termination. Fire-and-forget: failures are logged, not
    /// returned, unless the request could not be issued at all.
    async fn kill(&self, handle: &JobHandle) -> JobResult<()>;

    /// Captured stdout/stderr of the whole pipeline.
    fn stdout_log(&self, ctx: &RunContext, handle: &JobHandle) -> PathBuf;
}
