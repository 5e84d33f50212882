//! Runs one cantilever case end to end on this machine.
//!
//! ```text
//! RUST_LOG=beam_runner=debug cargo run -- [runner.toml] [elmer|ansys]
//! ```
//!
//! The solver toolchain named in the config must be installed; without it
//! the run ends `Failed` and the captured log shows which stage was missing.

use std::sync::Arc;
use std::time::Duration;

use beam_runner::{
    BackendKind, BeamCase, FileStore, JobResult, JobRunner, LaunchMode, Resources, RunnerConfig,
};
use tracing_subscriber::EnvFilter;

fn cantilever() -> BeamCase {
    BeamCase {
        name: "Demo Steel Bar".into(),
        length: 1.0,
        width: 0.1,
        height: 0.05,
        mesh_size: 0.01,
        modulus: 200e9,
        poisson: 0.3,
        density: 7850.0,
        material: "Steel".into(),
        load: 1000.0,
    }
}

#[tokio::main]
async fn main() -> JobResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    }
    .with_launch(LaunchMode::Local);
    let backend = match args.next().as_deref() {
        Some("ansys") => BackendKind::Ansys,
        _ => BackendKind::Elmer,
    };

    let store = FileStore::new(config.scratch_root()?.join(".jobs"));
    let runner = JobRunner::new(Arc::new(config), Arc::new(store));

    let case = cantilever();
    let mut job = runner.create(&case, backend, Resources::serial()).await?;
    println!("Created job {} ({backend})", job.id);

    runner.submit(&mut job, &case).await?;
    println!(
        "Submitted as process group {}",
        job.handle.as_ref().map(|h| h.as_str()).unwrap_or("-")
    );

    let status = runner
        .wait(&mut job, Duration::from_secs(2), 1800)
        .await?;
    println!("Finished: {status}");

    if let Some(log) = runner.stdout_log_path(&job) {
        println!("Log: {}", log.display());
    }
    let results = runner.results(&job).await?;
    match (results.displacement, results.stress) {
        (Some(displacement), Some(stress)) => {
            println!("Tip displacement: {displacement:.6e} m");
            println!("Peak stress:      {stress:.6e} Pa");
        }
        _ => println!("No scalar results were produced"),
    }
    for view in runner.result_artifact_paths(&job) {
        println!("View: {}", view.display());
    }

    let stats = runner.run_statistics(&job).await?;
    if let Some(nodes) = stats.nodes {
        println!("Nodes: {nodes}");
    }

    Ok(())
}
