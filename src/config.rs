//! Runner configuration.
//!
//! A [`RunnerConfig`] is resolved once at process start (typically from a
//! TOML file) and shared as `Arc<RunnerConfig>`. Executable paths and the
//! launch strategy live here instead of being chosen per host at runtime.
//!
//! ```toml
//! launch = "pbs"
//! max_cores = 16
//! max_machines = 16
//!
//! [toolchain]
//! elmer_solver = "/apps/elmer/bin/ElmerSolver"
//! paraview = "/apps/paraview/bin/pvbatch"
//! use_mumps = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};
use crate::launcher::LaunchMode;

/// Executables used by the generated launch scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    pub gmsh: String,
    pub elmer_grid: String,
    pub elmer_solver: String,
    /// MPI build of the Elmer solver, used when `cores > 1`.
    pub elmer_solver_mpi: String,
    pub mpirun: String,
    /// ParaView batch interpreter.
    pub paraview: String,
    pub ansys: String,
    /// Use the MUMPS direct solver in Elmer input decks.
    pub use_mumps: bool,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            gmsh: "gmsh".into(),
            elmer_grid: "ElmerGrid".into(),
            elmer_solver: "ElmerSolver".into(),
            elmer_solver_mpi: "ElmerSolver_mpi".into(),
            mpirun: "mpirun".into(),
            paraview: "pvbatch".into(),
            ansys: "ansys162".into(),
            use_mumps: false,
        }
    }
}

/// PBS/Torque command names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbsCommands {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
}

impl Default for PbsCommands {
    fn default() -> Self {
        Self {
            qsub: "qsub".into(),
            qstat: "qstat".into(),
            qdel: "qdel".into(),
        }
    }
}

/// Process-wide settings for staging, launching and polling jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root of all staging directories. Defaults to `$HOME/Scratch`.
    pub scratch_root: Option<PathBuf>,
    /// Launch strategy for new submissions.
    pub launch: LaunchMode,
    /// Shell that runs launch scripts.
    pub shell: String,
    pub max_cores: u32,
    pub max_machines: u32,
    /// Upper bound for every external command (submit, status, cancel).
    pub command_timeout_secs: u64,
    pub toolchain: Toolchain,
    pub pbs: PbsCommands,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scratch_root: None,
            launch: LaunchMode::Local,
            shell: "/bin/bash".into(),
            max_cores: 1,
            max_machines: 1,
            command_timeout_secs: 30,
            toolchain: Toolchain::default(),
            pbs: PbsCommands::default(),
        }
    }
}

impl RunnerConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> JobResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| JobError::Configuration(format!("invalid runner config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> JobResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            JobError::Configuration(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Use an explicit scratch root.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Use a launch strategy.
    pub fn with_launch(mut self, launch: LaunchMode) -> Self {
        self.launch = launch;
        self
    }

    /// Resolve the scratch root, falling back to `$HOME/Scratch`.
    pub fn scratch_root(&self) -> JobResult<PathBuf> {
        if let Some(root) = &self.scratch_root {
            return Ok(root.clone());
        }
        match dirs::home_dir() {
            Some(home) if home.is_dir() => Ok(home.join("Scratch")),
            _ => Err(JobError::StagingFailed {
                path: PathBuf::from("~/Scratch"),
                reason: "no home directory".into(),
            }),
        }
    }

    /// Timeout for a single external command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    fn check(&self) -> JobResult<()> {
        if self.max_cores == 0 || self.max_machines == 0 {
            return Err(JobError::Configuration(
                "max_cores and max_machines must be at least 1".into(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(JobError::Configuration(
                "command_timeout_secs must be at least 1".into(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(JobError::Configuration("shell must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = RunnerConfig::from_toml_str("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.launch, LaunchMode::Local);
        assert_eq!(config.pbs.qstat, "qstat");
    }

    #[test]
    fn test_partial_document() {
        let config = RunnerConfig::from_toml_str(
            r#"
            launch = "pbs"
            max_cores = 16
            scratch_root = "/gpfs/scratch"

            [toolchain]
            paraview = "/apps/paraview/bin/pvbatch"
            use_mumps = true
            "#,
        )
        .unwrap();

        assert_eq!(config.launch, LaunchMode::Scheduler);
        assert_eq!(config.max_cores, 16);
        assert_eq!(config.max_machines, 1);
        assert_eq!(config.toolchain.paraview, "/apps/paraview/bin/pvbatch");
        assert_eq!(config.toolchain.gmsh, "gmsh");
        assert!(config.toolchain.use_mumps);
        assert_eq!(
            config.scratch_root().unwrap(),
            PathBuf::from("/gpfs/scratch")
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(RunnerConfig::from_toml_str("max_cores = 0").is_err());
        assert!(RunnerConfig::from_toml_str("command_timeout_secs = 0").is_err());
        assert!(RunnerConfig::from_toml_str("launch = \"slurm\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "command_timeout_secs = 5\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));

        assert!(RunnerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
