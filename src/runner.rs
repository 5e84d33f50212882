//! Job state machine.
//!
//! [`JobRunner`] owns no job state of its own. Each operation takes the
//! caller's [`Job`], performs the external work, applies the transition and
//! saves the record before returning:
//!
//! | Operation | Legal from | Result |
//! |-----------|------------|--------|
//! | `submit()` | not `Submitted`/`Active`/`Running` | `Submitted`, or `Failed` on any step error |
//! | `check_status()` | any | resolved status; terminal statuses are not re-queried |
//! | `kill()` | `Submitted`/`Active`/`Running` (no-op if `Terminated`) | `Terminated` |
//! | `clean()` | cleanable | `Unsubmitted`, staging directory removed |
//! | `ready()` | any | `Unsubmitted`, staging directory removed |
//! | `destroy()` | destroyable, or any with `force` | record and staging directory removed |
//!
//! A rejected operation returns [`JobError::IllegalTransition`] and leaves
//! the job untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, ResultName, RunContext, RunStatistics, SolverBackend};
use crate::case::BeamCase;
use crate::classifier::{Verdict, classify};
use crate::config::RunnerConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobHandle, JobId, JobStatus, Resources};
use crate::launcher::{
    CommandRunner, LaunchMode, Launcher, LocalLauncher, Probe, SchedulerLauncher,
    SystemCommandRunner, default_process_table,
};
use crate::store::JobStore;
use crate::workspace::Workspace;

/// Scalar results of a finished run. `None` until the extraction step has
/// written the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarResults {
    /// FEM tip displacement.
    pub displacement: Option<f64>,
    /// FEM peak stress.
    pub stress: Option<f64>,
}

/// Drives jobs through their lifecycle.
pub struct JobRunner {
    config: Arc<RunnerConfig>,
    store: Arc<dyn JobStore>,
    scratch_root: Option<PathBuf>,
    backends: FxHashMap<BackendKind, Arc<dyn SolverBackend>>,
    launchers: FxHashMap<LaunchMode, Arc<dyn Launcher>>,
}

impl JobRunner {
    /// Runner with both solver backends and both launch strategies, running
    /// external commands with the configured timeout.
    ///
    /// The scratch root is resolved here. Without one every submission
    /// fails with [`JobError::StagingFailed`].
    pub fn new(config: Arc<RunnerConfig>, store: Arc<dyn JobStore>) -> Self {
        let scratch_root = match config.scratch_root() {
            Ok(root) => Some(root),
            Err(e) => {
                warn!(error = %e, "no scratch root, submissions will fail");
                None
            }
        };
        let commands: Arc<dyn CommandRunner> =
            Arc::new(SystemCommandRunner::new(config.command_timeout()));

        let backends = BackendKind::ALL
            .into_iter()
            .map(|kind| (kind, kind.adapter(&config.toolchain)))
            .collect();

        let mut launchers: FxHashMap<LaunchMode, Arc<dyn Launcher>> = FxHashMap::default();
        launchers.insert(
            LaunchMode::Local,
            Arc::new(LocalLauncher::new(
                config.shell.clone(),
                default_process_table(commands.clone()),
            )),
        );
        launchers.insert(
            LaunchMode::Scheduler,
            Arc::new(SchedulerLauncher::new(
                config.pbs.clone(),
                config.shell.clone(),
                commands,
            )),
        );

        Self {
            config,
            store,
            scratch_root,
            backends,
            launchers,
        }
    }

    /// Replace the adapter for `backend.kind()`.
    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    /// Replace the launcher for `launcher.mode()`.
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launchers.insert(launcher.mode(), launcher);
        self
    }

    /// Settings this runner was built with.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Store every transition is saved to.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Scratch root resolved at construction, `None` if there is none.
    pub fn scratch_root(&self) -> Option<&Path> {
        self.scratch_root.as_deref()
    }

    fn backend(&self, kind: BackendKind) -> JobResult<Arc<dyn SolverBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| JobError::Configuration(format!("no {kind} backend registered")))
    }

    fn launcher(&self, mode: LaunchMode) -> JobResult<Arc<dyn Launcher>> {
        self.launchers
            .get(&mode)
            .cloned()
            .ok_or_else(|| JobError::Configuration(format!("no {mode} launcher registered")))
    }

    /// Launch mode of the job's current attempt, or the configured default.
    fn mode_of(&self, job: &Job) -> LaunchMode {
        job.launch_mode.unwrap_or(self.config.launch)
    }

    fn context(&self, job: &Job) -> Option<RunContext> {
        Some(RunContext {
            workdir: job.workdir.clone()?,
            prefix: job.prefix.clone(),
            resources: job.resources(),
            mode: self.mode_of(job),
            shell: self.config.shell.clone(),
        })
    }

    async fn record(&self, job: &Job, from: JobStatus) -> JobResult<()> {
        self.store.save(job).await?;
        info!(job = %job.id, %from, to = %job.status, "job transition");
        Ok(())
    }

    /// Validate resources against the configured platform maximum.
    pub fn resources(&self, cores: u32, machines: u32) -> JobResult<Resources> {
        Resources::new(
            cores,
            machines,
            self.config.max_cores,
            self.config.max_machines,
        )
    }

    /// Create and save an unsubmitted job for a case.
    ///
    /// A case has at most one job. If a record already exists it is
    /// returned unchanged, unless the job may still be live, which is
    /// rejected.
    pub async fn create(
        &self,
        case: &BeamCase,
        backend: BackendKind,
        resources: Resources,
    ) -> JobResult<Job> {
        case.validate()?;
        let resources = self.resources(resources.cores, resources.machines)?;
        let prefix = case.prefix();
        if let Some(existing) = self.store.load(&JobId::new(prefix.clone())).await? {
            if !existing.is_destroyable() {
                return Err(JobError::illegal("create", existing.status));
            }
            debug!(job = %existing.id, status = %existing.status, "job already exists");
            return Ok(existing);
        }
        let job = Job::new(prefix.clone(), prefix, backend, resources);
        self.store.save(&job).await?;
        info!(job = %job.id, %backend, "job created");
        Ok(job)
    }

    /// Change the requested resources of an editable job.
    pub async fn set_resources(&self, job: &mut Job, cores: u32, machines: u32) -> JobResult<()> {
        let resources = self.resources(cores, machines)?;
        job.set_resources(resources)?;
        self.store.save(job).await
    }

    /// Change the backend of a job that has never been submitted.
    pub async fn set_backend(&self, job: &mut Job, backend: BackendKind) -> JobResult<()> {
        job.set_backend(backend)?;
        self.store.save(job).await
    }

    /// Stage, materialize and launch a new attempt.
    ///
    /// Any failure after validation leaves the job `Failed` with no handle
    /// and the partially written staging directory in place, then returns
    /// the error.
    pub async fn submit(&self, job: &mut Job, case: &BeamCase) -> JobResult<()> {
        if job.status.is_active() || job.status.is_running() {
            return Err(JobError::illegal("submit", job.status));
        }
        case.validate()?;
        let backend = self.backend(job.backend())?;
        let mode = self.config.launch;
        let launcher = self.launcher(mode)?;

        let from = job.status;
        job.handle = None;
        job.launch_mode = Some(mode);
        job.attempts += 1;

        match self.launch(job, case, backend.as_ref(), launcher.as_ref()).await {
            Ok(handle) => {
                job.handle = Some(handle);
                job.submitted_at = Some(Utc::now());
                job.set_status(JobStatus::Submitted);
                self.record(job, from).await
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "submission failed");
                job.set_status(JobStatus::Failed);
                if let Err(save_err) = self.record(job, from).await {
                    warn!(job = %job.id, error = %save_err, "could not save failed submission");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        job: &mut Job,
        case: &BeamCase,
        backend: &dyn SolverBackend,
        launcher: &dyn Launcher,
    ) -> JobResult<JobHandle> {
        let root = self.scratch_root.clone().ok_or_else(|| JobError::StagingFailed {
            path: PathBuf::from("~/Scratch"),
            reason: "no home directory".into(),
        })?;
        let workspace = Workspace::new(root);
        let workdir = workspace.stage(&job.prefix).await?;
        job.workdir = Some(workdir.clone());

        let ctx = RunContext {
            workdir,
            prefix: job.prefix.clone(),
            resources: job.resources(),
            mode: launcher.mode(),
            shell: self.config.shell.clone(),
        };
        remove_stale_outputs(backend, &ctx).await;

        let artifacts = backend.materialize(case, &ctx).await?;
        let mut script = backend.launch_script(&artifacts, &ctx);
        script.directives = launcher.directives(&ctx);
        let script_path = ctx.launch_script_path();
        script.write_to(&script_path).await?;

        let handle = launcher.submit(&script_path, &ctx).await?;
        debug!(job = %job.id, %handle, mode = %launcher.mode(), "launched");
        Ok(handle)
    }

    /// Query the launcher and resolve the job's current status.
    ///
    /// Transient query failures are returned without touching the job. The
    /// stored record is authoritative: it is adopted before the query, and
    /// the result is saved only if the record still matches, so a
    /// concurrent kill or reset wins over the poll.
    pub async fn check_status(&self, job: &mut Job) -> JobResult<JobStatus> {
        if let Some(stored) = self.store.load(&job.id).await? {
            *job = stored;
        }
        let Some(handle) = job.handle.clone() else {
            return Ok(job.status);
        };
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        let Some(ctx) = self.context(job) else {
            return Ok(job.status);
        };
        let backend = self.backend(job.backend())?;
        let launcher = self.launcher(ctx.mode)?;

        let probe = launcher.poll(&handle, backend.pipeline_shape()).await?;
        let resolved = match probe {
            Probe::Active => JobStatus::Active,
            Probe::Running => JobStatus::Running,
            Probe::Settling => {
                let log = launcher.stdout_log(&ctx, &handle);
                match classify(backend.as_ref(), &log, &backend.primary_artifact(&ctx)).await {
                    Verdict::Completed => JobStatus::Completed,
                    Verdict::Failed(_) => JobStatus::Running,
                }
            }
            Probe::Finished => {
                let log = launcher.stdout_log(&ctx, &handle);
                classify(backend.as_ref(), &log, &backend.primary_artifact(&ctx))
                    .await
                    .status()
            }
            Probe::Unrecognized(code) => {
                warn!(job = %job.id, %code, "unrecognized scheduler state");
                JobStatus::Unknown
            }
        };

        let resolved = forward_only(job.status, resolved);
        if resolved == job.status {
            return Ok(job.status);
        }
        let from = job.status;
        let mut next = job.clone();
        next.set_status(resolved);
        if self.store.save_if(&next, from, Some(&handle)).await? {
            *job = next;
            info!(job = %job.id, %from, to = %job.status, "job transition");
            return Ok(job.status);
        }

        match self.store.load(&job.id).await? {
            Some(stored) => {
                debug!(job = %job.id, stored = %stored.status, "record changed during poll");
                *job = stored;
            }
            None => debug!(job = %job.id, "record removed during poll"),
        }
        Ok(job.status)
    }

    /// Request termination and mark the job `Terminated` without waiting for
    /// confirmation. Killing a `Terminated` job is a no-op.
    pub async fn kill(&self, job: &mut Job) -> JobResult<()> {
        if job.status == JobStatus::Terminated {
            return Ok(());
        }
        if !job.is_terminatable() {
            return Err(JobError::illegal("kill", job.status));
        }
        if let Some(handle) = &job.handle {
            let launcher = self.launcher(self.mode_of(job))?;
            if let Err(e) = launcher.kill(handle).await {
                warn!(job = %job.id, %handle, error = %e, "termination request failed");
            }
        }
        let from = job.status;
        job.set_status(JobStatus::Terminated);
        self.record(job, from).await
    }

    /// Remove the staging directory of a finished attempt and reset.
    pub async fn clean(&self, job: &mut Job) -> JobResult<()> {
        if !job.is_cleanable() {
            return Err(JobError::illegal("clean", job.status));
        }
        self.reset(job).await
    }

    /// Reset to `Unsubmitted` from any status, removing the staging
    /// directory.
    pub async fn ready(&self, job: &mut Job) -> JobResult<()> {
        if job.is_terminatable() {
            warn!(job = %job.id, status = %job.status, "resetting a job that may still be live");
        }
        self.reset(job).await
    }

    async fn reset(&self, job: &mut Job) -> JobResult<()> {
        if let Some(workdir) = &job.workdir {
            Workspace::unstage(workdir).await?;
        }
        let from = job.status;
        job.reset();
        self.record(job, from).await
    }

    /// Remove the staging directory and the stored record. Without `force`
    /// a live job is rejected; with it the job is killed first.
    pub async fn destroy(&self, job: &mut Job, force: bool) -> JobResult<()> {
        if !job.is_destroyable() {
            if !force {
                return Err(JobError::illegal("destroy", job.status));
            }
            self.kill(job).await?;
        }
        if let Some(workdir) = &job.workdir {
            Workspace::unstage(workdir).await?;
        }
        self.store.remove(&job.id).await?;
        info!(job = %job.id, "job destroyed");
        Ok(())
    }

    /// Poll until the job reaches a terminal status or has no handle.
    ///
    /// Transient query failures count as a poll and are retried. Gives up
    /// with [`JobError::Timeout`] after `max_polls` queries.
    pub async fn wait(
        &self,
        job: &mut Job,
        interval: Duration,
        max_polls: u32,
    ) -> JobResult<JobStatus> {
        for _ in 0..max_polls {
            match self.check_status(job).await {
                Ok(status) if status.is_terminal() || job.handle.is_none() => return Ok(status),
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    debug!(job = %job.id, error = %e, "transient status failure, retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
        Err(JobError::Timeout(format!(
            "job {} still {} after {max_polls} polls",
            job.id, job.status
        )))
    }

    /// Tip displacement and peak stress, as far as they have been produced.
    pub async fn results(&self, job: &Job) -> JobResult<ScalarResults> {
        let Some(ctx) = self.context(job) else {
            return Ok(ScalarResults::default());
        };
        let backend = self.backend(job.backend())?;
        Ok(ScalarResults {
            displacement: backend.extract_scalar(&ctx, ResultName::Displacement).await,
            stress: backend.extract_scalar(&ctx, ResultName::Stress).await,
        })
    }

    /// Solver statistics parsed from the captured log.
    pub async fn run_statistics(&self, job: &Job) -> JobResult<RunStatistics> {
        let Some(log) = self.stdout_log_path(job) else {
            return Ok(RunStatistics::default());
        };
        Ok(self.backend(job.backend())?.run_statistics(&log).await)
    }

    /// Captured stdout/stderr of the current attempt.
    pub fn stdout_log_path(&self, job: &Job) -> Option<PathBuf> {
        let ctx = self.context(job)?;
        let handle = job.handle.as_ref()?;
        let launcher = self.launcher(ctx.mode).ok()?;
        Some(launcher.stdout_log(&ctx, handle))
    }

    /// Rendered result views of the current attempt.
    pub fn result_artifact_paths(&self, job: &Job) -> Vec<PathBuf> {
        match (self.context(job), self.backend(job.backend())) {
            (Some(ctx), Ok(backend)) => backend.result_artifacts(&ctx),
            _ => Vec::new(),
        }
    }
}

/// Keep the current status if a poll would move the attempt backwards
/// through the pre-terminal states.
fn forward_only(current: JobStatus, resolved: JobStatus) -> JobStatus {
    fn rank(status: JobStatus) -> Option<u8> {
        match status {
            JobStatus::Submitted => Some(1),
            JobStatus::Active => Some(2),
            JobStatus::Running => Some(3),
            _ => None,
        }
    }
    match (rank(current), rank(resolved)) {
        (Some(c), Some(r)) if r < c => current,
        _ => resolved,
    }
}

/// Results of an earlier attempt must not be mistaken for this one's.
async fn remove_stale_outputs(backend: &dyn SolverBackend, ctx: &RunContext) {
    let stale = [
        backend.primary_artifact(ctx),
        ctx.file(ResultName::Displacement.extension()),
        ctx.file(ResultName::Stress.extension()),
    ];
    for path in stale {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale output"),
        }
    }
}
