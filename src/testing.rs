//! Fakes for unit tests: a scripted command runner, a fixed process table and
//! a solver backend that runs plain shell stages.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::backend::{
    ArtifactSet, BackendKind, LaunchScript, PipelineShape, RunContext, STAGE_FAILED_MARKER,
    SolverBackend, read_optional, write_artifact,
};
use crate::case::BeamCase;
use crate::error::{JobError, JobResult};
use crate::launcher::{CommandOutput, CommandRunner, Invocation, ProcessTable};

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    FailToStart,
}

/// Answers invocations from per-program canned responses and records every
/// call. Programs without a response succeed with empty output.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    responses: Mutex<FxHashMap<String, Scripted>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    /// Answer every later call to `program` with this output.
    pub fn respond(&self, program: &str, success: bool, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().insert(
            program.to_string(),
            Scripted::Output(CommandOutput {
                success,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
    }

    /// Make every later call to `program` fail as if it were not installed.
    pub fn fail_to_start(&self, program: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(program.to_string(), Scripted::FailToStart);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|call| call.program == program)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> JobResult<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get(&invocation.program)
            .cloned();
        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::FailToStart) => Err(JobError::Command {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            }),
            None => Ok(CommandOutput {
                success: true,
                ..CommandOutput::default()
            }),
        }
    }
}

/// Reports a settable number of live processes for any group.
#[derive(Debug, Default)]
pub(crate) struct FixedProcessTable {
    count: AtomicUsize,
}

impl FixedProcessTable {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    pub fn set(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessTable for FixedProcessTable {
    async fn count_group(&self, _pgid: i32) -> JobResult<usize> {
        Ok(self.count.load(Ordering::SeqCst))
    }
}

/// Backend whose pipeline is a list of shell stages.
///
/// The primary artifact is `<prefix>.result`; a log is unhealthy if it
/// contains `ERROR` or a stage failure marker.
#[derive(Debug, Clone)]
pub(crate) struct FakeBackend {
    pub fail_materialize: bool,
    pub shape: PipelineShape,
    pub stages: Vec<(String, String)>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            fail_materialize: false,
            shape: PipelineShape::MultiStage,
            stages: Vec::new(),
        }
    }
}

impl FakeBackend {
    pub fn failing() -> Self {
        Self {
            fail_materialize: true,
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, name: &str, command: &str) -> Self {
        self.stages.push((name.to_string(), command.to_string()));
        self
    }

    pub fn with_shape(mut self, shape: PipelineShape) -> Self {
        self.shape = shape;
        self
    }
}

#[async_trait]
impl SolverBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Elmer
    }

    fn pipeline_shape(&self) -> PipelineShape {
        self.shape
    }

    async fn materialize(&self, case: &BeamCase, ctx: &RunContext) -> JobResult<ArtifactSet> {
        let input_deck = ctx.file("deck");
        if self.fail_materialize {
            return Err(JobError::MaterializationFailed {
                path: input_deck,
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        write_artifact(&input_deck, &format!("length {}\n", case.length)).await?;
        let extraction_script = ctx.file("extract");
        write_artifact(&extraction_script, "true\n").await?;
        let visualization_script = ctx.file("view");
        write_artifact(&visualization_script, "true\n").await?;
        Ok(ArtifactSet {
            geometry: None,
            input_deck,
            extraction_script,
            visualization_script,
            extras: Vec::new(),
        })
    }

    fn launch_script(&self, _artifacts: &ArtifactSet, ctx: &RunContext) -> LaunchScript {
        let mut script = LaunchScript::new(&ctx.shell);
        for (name, command) in &self.stages {
            script.stage(name, command);
        }
        script
    }

    fn primary_artifact(&self, ctx: &RunContext) -> PathBuf {
        ctx.file("result")
    }

    fn result_artifacts(&self, ctx: &RunContext) -> Vec<PathBuf> {
        vec![self.primary_artifact(ctx)]
    }

    async fn is_output_healthy(&self, stdout_log: &Path) -> bool {
        match read_optional(stdout_log).await {
            Some(text) => !text.contains("ERROR") && !text.contains(STAGE_FAILED_MARKER),
            None => false,
        }
    }
}
