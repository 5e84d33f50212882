//! Solver backend trait and shared artifact types.
//!
//! A [`SolverBackend`] turns a [`BeamCase`] into the files one simulation
//! engine needs, builds the shell pipeline that runs it, and reads results
//! back once the pipeline has finished:
//!
//! ```text
//!   materialize() ──→ launch_script() ──→ (launcher) ──→ is_output_healthy()
//!      (async)            (sync)                          primary_artifact()
//!                                                          extract_scalar()
//! ```
//!
//! ## Method table
//!
//! | Method | Kind | Returns |
//! |--------|------|---------|
//! | `kind()` | sync | `BackendKind` |
//! | `pipeline_shape()` | sync | `PipelineShape` |
//! | `materialize()` | async | `JobResult<ArtifactSet>` |
//! | `launch_script()` | sync | `LaunchScript` |
//! | `primary_artifact()` | sync | `PathBuf` |
//! | `result_artifacts()` | sync | `Vec<PathBuf>` |
//! | `extract_scalar()` | async | `Option<f64>` |
//! | `is_output_healthy()` | async | `bool` |
//! | `run_statistics()` | async, provided | `RunStatistics` |
//!
//! `materialize()` is deterministic in its inputs, so a retried submission
//! rewrites identical files.

mod ansys;
mod elmer;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::case::BeamCase;
use crate::config::Toolchain;
use crate::error::{JobError, JobResult};
use crate::job::Resources;
use crate::launcher::LaunchMode;

pub use ansys::AnsysBackend;
pub use elmer::ElmerBackend;

/// Log line written by a launch script when a pipeline stage exits non-zero.
pub const STAGE_FAILED_MARKER: &str = "STAGE FAILED:";

/// Which simulation engine a job uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Gmsh + ElmerGrid + ElmerSolver + ParaView.
    Elmer,
    /// ANSYS Mechanical APDL + ParaView.
    Ansys,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Elmer, BackendKind::Ansys];

    /// Build the adapter for this engine.
    pub fn adapter(&self, toolchain: &Toolchain) -> Arc<dyn SolverBackend> {
        match self {
            BackendKind::Elmer => Arc::new(ElmerBackend::new(toolchain.clone())),
            BackendKind::Ansys => Arc::new(AnsysBackend::new(toolchain.clone())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Elmer => "Elmer",
            BackendKind::Ansys => "Ansys",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// How to read a process count of one in the local launcher.
///
/// The launch script's shell is the process-group leader, so one live
/// process means the shell is alive with no stage running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineShape {
    /// Stages follow each other closely; a lone shell is still `Running`.
    MultiStage,
    /// A lone shell is wrapping up; completion is verified before reporting.
    Short,
}

/// Scalar results a backend can extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultName {
    /// Tip displacement along y.
    Displacement,
    /// Peak bending stress at the wall.
    Stress,
}

impl ResultName {
    /// Extension of the file the extraction step writes.
    pub fn extension(&self) -> &'static str {
        match self {
            ResultName::Displacement => "displ",
            ResultName::Stress => "stress",
        }
    }
}

/// Everything that locates one attempt on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub workdir: PathBuf,
    pub prefix: String,
    pub resources: Resources,
    pub mode: LaunchMode,
    /// Shell that runs launch and helper scripts.
    pub shell: String,
}

impl RunContext {
    /// `<workdir>/<prefix>.<extension>`
    pub fn file(&self, extension: &str) -> PathBuf {
        self.workdir.join(format!("{}.{extension}", self.prefix))
    }

    /// Results subdirectory, `<workdir>/<prefix>/`.
    pub fn results_dir(&self) -> PathBuf {
        self.workdir.join(&self.prefix)
    }

    /// Where the launch script is written.
    pub fn launch_script_path(&self) -> PathBuf {
        self.file("sh")
    }
}

/// Files written by `materialize()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSet {
    /// Mesh/geometry description, if the engine meshes separately.
    pub geometry: Option<PathBuf>,
    pub input_deck: PathBuf,
    /// Post-run script that writes the scalar result files.
    pub extraction_script: PathBuf,
    /// Post-run script that renders the result views.
    pub visualization_script: PathBuf,
    /// Extra files (e.g. MPI start info).
    pub extras: Vec<PathBuf>,
}

impl ArtifactSet {
    /// All artifact paths.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.geometry
            .iter()
            .chain([
                &self.input_deck,
                &self.extraction_script,
                &self.visualization_script,
            ])
            .chain(self.extras.iter())
    }
}

/// Shell script that runs a pipeline end to end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchScript {
    pub shell: String,
    /// Scheduler directives placed right after the shebang.
    pub directives: Vec<String>,
    pub commands: Vec<String>,
}

impl LaunchScript {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            ..Self::default()
        }
    }

    /// Append a plain command line.
    pub fn command(&mut self, line: impl Into<String>) -> &mut Self {
        self.commands.push(line.into());
        self
    }

    /// Append a pipeline stage that aborts the script and leaves a
    /// [`STAGE_FAILED_MARKER`] line in the log when it exits non-zero.
    pub fn stage(&mut self, name: &str, line: impl AsRef<str>) -> &mut Self {
        self.commands.push(format!(
            "{} || {{ echo \"{STAGE_FAILED_MARKER} {name} (exit $?)\"; exit 1; }}",
            line.as_ref()
        ));
        self
    }

    /// Render the script text.
    pub fn render(&self) -> String {
        let shebang = if self.shell.starts_with('/') {
            format!("#!{}", self.shell)
        } else {
            format!("#!/usr/bin/env {}", self.shell)
        };
        let mut out = String::with_capacity(256);
        for line in std::iter::once(&shebang)
            .chain(self.directives.iter())
            .chain(self.commands.iter())
        {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Write the rendered script to `path`.
    pub async fn write_to(&self, path: &Path) -> JobResult<()> {
        write_artifact(path, &self.render()).await
    }
}

/// Solver statistics parsed from the captured log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub nodes: Option<u64>,
    pub elements: Option<u64>,
    pub cpu_time_secs: Option<f64>,
    pub wall_time_secs: Option<f64>,
}

/// Strategy for one simulation engine.
#[async_trait]
pub trait SolverBackend: Send + Sync {
    /// Which engine this is.
    fn kind(&self) -> BackendKind;

    /// How the local launcher should read a lone live process.
    fn pipeline_shape(&self) -> PipelineShape;

    /// Write every file the engine needs into `ctx.workdir`.
    async fn materialize(&self, case: &BeamCase, ctx: &RunContext) -> JobResult<ArtifactSet>;

    /// Commands that run the pipeline: pre-processing, solve, extraction,
    /// visualization. Scheduler directives are added by the launcher.
    fn launch_script(&self, artifacts: &ArtifactSet, ctx: &RunContext) -> LaunchScript;

    /// File whose existence marks a successful run.
    fn primary_artifact(&self, ctx: &RunContext) -> PathBuf;

    /// Rendered result views, for display.
    fn result_artifacts(&self, ctx: &RunContext) -> Vec<PathBuf>;

    /// First number in the result file for `name`, or `None` if the file has
    /// not been produced.
    async fn extract_scalar(&self, ctx: &RunContext, name: ResultName) -> Option<f64> {
        read_first_number(&ctx.file(name.extension())).await
    }

    /// `false` if the log is missing or contains an error marker.
    async fn is_output_healthy(&self, stdout_log: &Path) -> bool;

    /// Solver statistics from the log. Empty unless the engine reports them.
    async fn run_statistics(&self, _stdout_log: &Path) -> RunStatistics {
        RunStatistics::default()
    }
}

/// Write one artifact, mapping failures to `MaterializationFailed`.
pub(crate) async fn write_artifact(path: &Path, contents: &str) -> JobResult<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| JobError::MaterializationFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Read a text file, `None` if it does not exist or cannot be read.
pub(crate) async fn read_optional(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read file");
            None
        }
    }
}

/// First whitespace- or comma-separated token that parses as a float.
pub(crate) async fn read_first_number(path: &Path) -> Option<f64> {
    let text = read_optional(path).await?;
    text.split(|c: char| c.is_whitespace() || c == ',')
        .find_map(|token| token.parse::<f64>().ok())
}
