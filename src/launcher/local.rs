//! Local launch strategy: the launch script runs as the leader of a new
//! process group, so the mesher, solver and post-processors it starts all
//! share the group id that becomes the job handle.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use super::process::ProcessTable;
use super::{LaunchMode, Launcher, Probe};
use crate::backend::{PipelineShape, RunContext};
use crate::error::{JobError, JobResult};
use crate::job::JobHandle;

/// Runs launch scripts as detached process groups on this machine.
pub struct LocalLauncher {
    shell: String,
    processes: Arc<dyn ProcessTable>,
}

impl LocalLauncher {
    /// Launcher running scripts with `shell`, counting live processes
    /// through `processes`.
    pub fn new(shell: impl Into<String>, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            shell: shell.into(),
            processes,
        }
    }
}

/// Group id from a handle. Ids 0 and 1 would address the caller's own group
/// or init and are never valid job handles.
fn group_id(handle: &JobHandle) -> Option<i32> {
    handle.as_str().parse::<i32>().ok().filter(|pgid| *pgid > 1)
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Local
    }

    async fn submit(&self, script: &Path, ctx: &RunContext) -> JobResult<JobHandle> {
        let log_path = ctx.file("out");
        let log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| {
                JobError::LaunchFailed(format!("cannot create '{}': {e}", log_path.display()))
            })?
            .into_std()
            .await;
        let log_err = log
            .try_clone()
            .map_err(|e| JobError::LaunchFailed(format!("cannot share log handle: {e}")))?;

        let child = Command::new(&self.shell)
            .arg(script)
            .current_dir(&ctx.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| JobError::LaunchFailed(format!("cannot spawn {}: {e}", self.shell)))?;

        let pgid = child
            .id()
            .ok_or_else(|| JobError::LaunchFailed("process exited before its id was read".into()))?;
        debug!(pgid, script = %script.display(), "spawned local process group");

        // Detached: the group is tracked through its id, not the child handle.
        drop(child);
        Ok(JobHandle::new(pgid.to_string()))
    }

    async fn poll(&self, handle: &JobHandle, shape: PipelineShape) -> JobResult<Probe> {
        let Some(pgid) = group_id(handle) else {
            return Ok(Probe::Unrecognized(handle.to_string()));
        };
        let live = self.processes.count_group(pgid).await?;
        Ok(match (live, shape) {
            (0, _) => Probe::Finished,
            (1, PipelineShape::Short) => Probe::Settling,
            _ => Probe::Running,
        })
    }

    async fn kill(&self, handle: &JobHandle) -> JobResult<()> {
        let Some(pgid) = group_id(handle) else {
            warn!(handle = %handle, "not a process-group id, nothing signalled");
            return Ok(());
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            Ok(()) => debug!(pgid, "sent SIGTERM to process group"),
            Err(Errno::ESRCH) => debug!(pgid, "process group already gone"),
            Err(e) => warn!(pgid, error = %e, "could not signal process group"),
        }
        Ok(())
    }

    fn stdout_log(&self, ctx: &RunContext, _handle: &JobHandle) -> PathBuf {
        ctx.file("out")
    }
}
