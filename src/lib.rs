//! Beam Runner: job execution and status tracking for cantilever-beam FEA runs
//!
//! This crate takes a [`BeamCase`] through one simulation attempt: it stages
//! a scratch directory, writes the solver artifacts, launches the pipeline
//! under a PBS scheduler or as a local process group, and works out from the
//! outside whether the run is queued, running, completed or failed.
//!
//! # Overview
//!
//! - [`SolverBackend`] turns a case into engine-specific files and reads
//!   results back ([`ElmerBackend`], [`AnsysBackend`])
//! - [`Launcher`] starts, polls and kills a launch script
//!   ([`SchedulerLauncher`], [`LocalLauncher`])
//! - [`classify`] decides `Completed` vs `Failed` from the captured log and
//!   the primary result artifact
//! - [`JobRunner`] is the state machine tying these together, persisting
//!   every transition through a [`JobStore`]
//! - [`JobError`] with categorized error variants
//!
//! # Lifecycle
//!
//! ```text
//!   create() ──→ submit() ──→ check_status() ──→ results()
//!                  │              │ (repeat)
//!                  │              └──→ kill() ──→ clean() / ready()
//!                  └──(error)──→ Failed
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use beam_runner::{BackendKind, JobRunner, MemoryStore, Resources, RunnerConfig};
//!
//! let config = Arc::new(RunnerConfig::load("runner.toml")?);
//! let runner = JobRunner::new(config, Arc::new(MemoryStore::new()));
//!
//! let mut job = runner.create(&case, BackendKind::Elmer, Resources::serial()).await?;
//! runner.submit(&mut job, &case).await?;
//! let status = runner.wait(&mut job, Duration::from_secs(5), 720).await?;
//! let results = runner.results(&job).await?;
//! ```

pub mod backend;
pub mod case;
pub mod classifier;
pub mod config;
pub mod error;
pub mod job;
pub mod launcher;
pub mod runner;
pub mod store;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use backend::{
    AnsysBackend, ArtifactSet, BackendKind, ElmerBackend, LaunchScript, PipelineShape, ResultName,
    RunContext, RunStatistics, SolverBackend,
};
pub use case::BeamCase;
pub use classifier::{FailureCause, Verdict, classify};
pub use config::{PbsCommands, RunnerConfig, Toolchain};
pub use error::{JobError, JobResult};
pub use job::{Job, JobHandle, JobId, JobStatus, Resources};
pub use launcher::{LaunchMode, Launcher, LocalLauncher, Probe, SchedulerLauncher};
pub use runner::{JobRunner, ScalarResults};
pub use store::{FileStore, JobStore, MemoryStore};
pub use workspace::Workspace;
