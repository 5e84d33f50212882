//! PBS/Torque launch strategy.
//!
//! Native `job_state` codes and how they map:
//!
//! | Code | Meaning | Probe |
//! |------|---------|-------|
//! | `Q` `H` `W` `T` `S` `E` | queued, held, waiting, moving, suspended, exiting | `Active` |
//! | `R` `B` | running, array begun | `Running` |
//! | `C` `F` `X` | completed, finished, expired | `Finished` |
//! | anything else | | `Unrecognized` |

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use super::command::{CommandRunner, Invocation};
use super::{LaunchMode, Launcher, Probe};
use crate::backend::{PipelineShape, RunContext};
use crate::config::PbsCommands;
use crate::error::{JobError, JobResult};
use crate::job::JobHandle;

/// Longest job name older PBS servers accept.
const PBS_JOB_NAME_MAX_LENGTH: usize = 15;

/// `qstat` messages meaning the job left the server's history.
const JOB_GONE_MESSAGES: [&str; 2] = ["Unknown Job Id", "Job has finished"];

static JOB_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<job_state>\s*([^<\s]+)\s*</job_state>").expect("static regex")
});

/// Extract the `job_state` element from a `qstat -x` document.
pub fn parse_job_state(document: &str) -> Option<String> {
    JOB_STATE
        .captures(document)
        .map(|captures| captures[1].to_string())
}

/// Map a native PBS state code to a probe.
pub fn map_pbs_state(code: &str) -> Probe {
    match code.to_ascii_uppercase().as_str() {
        "Q" | "H" | "W" | "T" | "S" | "E" => Probe::Active,
        "R" | "B" => Probe::Running,
        "C" | "F" | "X" => Probe::Finished,
        _ => Probe::Unrecognized(code.to_string()),
    }
}

fn job_name(prefix: &str) -> String {
    prefix.chars().take(PBS_JOB_NAME_MAX_LENGTH).collect()
}

/// Submits launch scripts with `qsub` and tracks them with `qstat`.
pub struct SchedulerLauncher {
    commands: PbsCommands,
    shell: String,
    runner: Arc<dyn CommandRunner>,
}

impl SchedulerLauncher {
    /// Launcher submitting with `commands.qsub`, running each command
    /// through `runner`.
    pub fn new(commands: PbsCommands, shell: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            commands,
            shell: shell.into(),
            runner,
        }
    }
}

#[async_trait]
impl Launcher for SchedulerLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Scheduler
    }

    fn directives(&self, ctx: &RunContext) -> Vec<String> {
        vec![
            format!("#PBS -S {}", self.shell),
            format!("#PBS -N {}", job_name(&ctx.prefix)),
            format!(
                "#PBS -l nodes={}:ppn={}",
                ctx.resources.machines, ctx.resources.cores
            ),
            "#PBS -j oe".to_string(),
        ]
    }

    async fn submit(&self, script: &Path, ctx: &RunContext) -> JobResult<JobHandle> {
        let invocation = Invocation::new(&self.commands.qsub)
            .arg(script.to_string_lossy())
            .current_dir(&ctx.workdir);
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| JobError::LaunchFailed(e.to_string()))?;

        let job_id = output.stdout.trim();
        if !output.success || job_id.is_empty() {
            return Err(JobError::LaunchFailed(format!(
                "{} returned no job id: {}",
                self.commands.qsub,
                output.stderr.trim()
            )));
        }
        Ok(JobHandle::new(job_id))
    }

    async fn poll(&self, handle: &JobHandle, _shape: PipelineShape) -> JobResult<Probe> {
        let invocation = Invocation::new(&self.commands.qstat)
            .arg(handle.as_str())
            .arg("-x");
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| JobError::PollTransient(e.to_string()))?;

        let document = output.stdout.trim();
        if document.is_empty() {
            let gone = output.success
                || JOB_GONE_MESSAGES
                    .iter()
                    .any(|message| output.stderr.contains(message));
            if gone {
                debug!(handle = %handle, "job no longer known to the scheduler");
                return Ok(Probe::Finished);
            }
            return Err(JobError::PollTransient(format!(
                "{invocation} failed: {}",
                output.stderr.trim()
            )));
        }

        Ok(match parse_job_state(document) {
            Some(code) => map_pbs_state(&code),
            None => Probe::Unrecognized("<no job_state>".into()),
        })
    }

    async fn kill(&self, handle: &JobHandle) -> JobResult<()> {
        let invocation = Invocation::new(&self.commands.qdel).arg(handle.as_str());
        match self.runner.run(&invocation).await {
            Ok(output) if !output.success => {
                warn!(handle = %handle, stderr = %output.stderr.trim(), "qdel reported an error");
            }
            Ok(_) => {}
            Err(e) => warn!(handle = %handle, error = %e, "qdel could not be run"),
        }
        Ok(())
    }

    /// `<jobname>.o<sequence>`, where the sequence is the handle before the
    /// server suffix.
    fn stdout_log(&self, ctx: &RunContext, handle: &JobHandle) -> PathBuf {
        let sequence = handle.as_str().split('.').next().unwrap_or_default();
        ctx.workdir
            .join(format!("{}.o{sequence}", job_name(&ctx.prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Resources;
    use crate::testing::ScriptedRunner;

    fn ctx() -> RunContext {
        RunContext {
            workdir: PathBuf::from("/scratch/steelbar1"),
            prefix: "steelbar1".into(),
            resources: Resources { cores: 8, machines: 2 },
            mode: LaunchMode::Scheduler,
            shell: "/bin/bash".into(),
        }
    }

    fn qstat_document(state: &str) -> String {
        format!(
            "<Data><Job><Job_Id>4242.pbs</Job_Id><Job_Name>steelbar1</Job_Name>\
             <job_state>{state}</job_state><queue>batch</queue></Job></Data>"
        )
    }

    fn launcher(runner: Arc<ScriptedRunner>) -> SchedulerLauncher {
        SchedulerLauncher::new(PbsCommands::default(), "/bin/bash", runner)
    }

    #[test]
    fn test_state_table() {
        for code in ["Q", "H", "W", "T", "S", "E", "q"] {
            assert_eq!(map_pbs_state(code), Probe::Active, "{code}");
        }
        assert_eq!(map_pbs_state("R"), Probe::Running);
        assert_eq!(map_pbs_state("B"), Probe::Running);
        for code in ["C", "F", "X"] {
            assert_eq!(map_pbs_state(code), Probe::Finished, "{code}");
        }
        assert_eq!(map_pbs_state("Z"), Probe::Unrecognized("Z".into()));
    }

    #[test]
    fn test_parse_job_state() {
        assert_eq!(parse_job_state(&qstat_document("R")).as_deref(), Some("R"));
        assert_eq!(
            parse_job_state("<job_state>\n  Q\n</job_state>").as_deref(),
            Some("Q")
        );
        assert_eq!(parse_job_state("<Data></Data>"), None);
    }

    #[test]
    fn test_directives() {
        let launcher = launcher(Arc::new(ScriptedRunner::default()));
        let mut ctx = ctx();
        ctx.prefix = "averyveryverylongbeamname".into();
        let directives = launcher.directives(&ctx);
        assert_eq!(
            directives,
            vec![
                "#PBS -S /bin/bash",
                "#PBS -N averyveryverylo",
                "#PBS -l nodes=2:ppn=8",
                "#PBS -j oe",
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_trims_job_id() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("qsub", true, "4242.pbs-server\n", "");
        let launcher = launcher(runner.clone());

        let handle = launcher
            .submit(Path::new("/scratch/steelbar1/steelbar1.sh"), &ctx())
            .await
            .unwrap();
        assert_eq!(handle.as_str(), "4242.pbs-server");

        let calls = runner.calls();
        assert_eq!(calls[0].program, "qsub");
        assert_eq!(calls[0].args, vec!["/scratch/steelbar1/steelbar1.sh"]);
        assert_eq!(calls[0].cwd.as_deref(), Some(Path::new("/scratch/steelbar1")));
    }

    #[tokio::test]
    async fn test_submit_without_job_id_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("qsub", true, "  \n", "");
        let err = launcher(runner)
            .submit(Path::new("job.sh"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LaunchFailed(_)));

        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("qsub", false, "", "qsub: Bad UID for job execution");
        let err = launcher(runner)
            .submit(Path::new("job.sh"), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Bad UID"));
    }

    #[tokio::test]
    async fn test_poll_maps_states() {
        let runner = Arc::new(ScriptedRunner::default());
        let launcher = launcher(runner.clone());
        let handle = JobHandle::new("4242.pbs");

        runner.respond("qstat", true, &qstat_document("Q"), "");
        assert_eq!(
            launcher.poll(&handle, PipelineShape::Short).await.unwrap(),
            Probe::Active
        );

        runner.respond("qstat", true, &qstat_document("R"), "");
        assert_eq!(
            launcher.poll(&handle, PipelineShape::Short).await.unwrap(),
            Probe::Running
        );

        runner.respond("qstat", true, &qstat_document("C"), "");
        assert_eq!(
            launcher.poll(&handle, PipelineShape::Short).await.unwrap(),
            Probe::Finished
        );

        let call = runner.calls().pop().unwrap();
        assert_eq!(call.args, vec!["4242.pbs", "-x"]);
    }

    #[tokio::test]
    async fn test_poll_distinguishes_gone_from_transient() {
        let runner = Arc::new(ScriptedRunner::default());
        let launcher = launcher(runner.clone());
        let handle = JobHandle::new("4242.pbs");

        runner.respond("qstat", false, "", "qstat: Unknown Job Id 4242.pbs");
        assert_eq!(
            launcher.poll(&handle, PipelineShape::Short).await.unwrap(),
            Probe::Finished
        );

        runner.respond("qstat", false, "", "Connection refused");
        let err = launcher
            .poll(&handle, PipelineShape::Short)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        runner.fail_to_start("qstat");
        let err = launcher
            .poll(&handle, PipelineShape::Short)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::PollTransient(_)));
    }

    #[tokio::test]
    async fn test_kill_is_fire_and_forget() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("qdel", false, "", "qdel: Unknown Job Id");
        let launcher = launcher(runner.clone());

        launcher.kill(&JobHandle::new("4242.pbs")).await.unwrap();
        let call = runner.calls().pop().unwrap();
        assert_eq!(call.program, "qdel");
        assert_eq!(call.args, vec!["4242.pbs"]);
    }

    #[test]
    fn test_stdout_log_name() {
        let launcher = launcher(Arc::new(ScriptedRunner::default()));
        assert_eq!(
            launcher.stdout_log(&ctx(), &JobHandle::new("4242.pbs-server")),
            PathBuf::from("/scratch/steelbar1/steelbar1.o4242")
        );
    }
}
