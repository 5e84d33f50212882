//! Open-source pipeline: Gmsh meshes the beam, ElmerGrid converts the mesh,
//! ElmerSolver solves linear elasticity, an awk step extracts scalars and
//! ParaView renders the result views.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{
    ArtifactSet, BackendKind, LaunchScript, PipelineShape, RunContext, SolverBackend,
    read_optional, write_artifact,
};
use crate::case::{BeamCase, GRAVITY};
use crate::config::Toolchain;
use crate::error::JobResult;
use crate::launcher::LaunchMode;

/// Any line mentioning an error or a failure marks the run unhealthy.
static ERROR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|fail").expect("static regex"));

/// Gmsh/Elmer toolchain adapter.
#[derive(Debug, Clone)]
pub struct ElmerBackend {
    toolchain: Toolchain,
}

impl ElmerBackend {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    fn geometry(case: &BeamCase) -> String {
        let (l, w, h, ms) = (case.length, case.width, case.height, case.mesh_size);

        // Even element count along the length puts a node row at mid-span;
        // odd node count across the width puts a node on the centerline.
        let mut elements_l = (l / ms) as u64;
        if elements_l % 2 == 1 {
            elements_l += 1;
        }
        let nodes_h = (h / ms) as u64 + 1;
        let mut nodes_w = (w / ms) as u64;
        if nodes_w % 2 == 0 {
            nodes_w += 1;
        }

        [
            format!("Point(1) = {{0, 0, 0, {ms}}};"),
            format!("Point(2) = {{{w}, 0, 0, {ms}}};"),
            format!("Point(3) = {{{w}, {h}, 0, {ms}}};"),
            format!("Point(4) = {{0, {h}, 0, {ms}}};"),
            "Line(1) = {1, 2};".into(),
            "Line(2) = {2, 3};".into(),
            "Line(3) = {3, 4};".into(),
            "Line(4) = {4, 1};".into(),
            "Line Loop(5) = {3, 4, 1, 2};".into(),
            "Plane Surface(6) = {5};".into(),
            format!("Extrude {{0, 0, {l}}} {{"),
            format!("  Surface{{6}}; Layers{{{elements_l}}}; Recombine;"),
            "}".into(),
            "Surface Loop(29) = {19, 6, 15, 28, 23, 27};".into(),
            "Volume(30) = {29};".into(),
            format!("Transfinite Line {{1, 3}} = {nodes_w};"),
            format!("Transfinite Line {{2, 4}} = {nodes_h};"),
            "Transfinite Surface \"*\";".into(),
            "Recombine Surface \"*\";".into(),
            "Transfinite Volume \"*\";".into(),
        ]
        .join("\n")
            + "\n"
    }

    fn input_deck(&self, case: &BeamCase, ctx: &RunContext) -> String {
        let prefix = &ctx.prefix;
        let (l, w, h) = (case.length, case.width, case.height);
        let (e, rho, p) = (case.modulus, case.density, case.load);
        let mut lines = vec![
            "Header".to_string(),
            "  CHECK KEYWORDS Warn".into(),
            format!("  Mesh DB \"{}\" \"{prefix}\"", ctx.workdir.display()),
            "  Include Path \"\"".into(),
            "  Results Directory \"\"".into(),
            "End".into(),
            String::new(),
            "Simulation".into(),
            "  Max Output Level = 5".into(),
            "  Coordinate System = Cartesian".into(),
            "  Coordinate Mapping(3) = 1 2 3".into(),
            "  Simulation Type = Steady state".into(),
            "  Steady State Max Iterations = 1".into(),
            "  Output Intervals = 1".into(),
            format!("  Solver Input File = {prefix}.sif"),
            format!("  Output File = {prefix}.result"),
            format!("  Post File = {prefix}.vtu"),
            "End".into(),
            String::new(),
            "Constants".into(),
            format!("  Gravity(4) = 0 -1 0 {GRAVITY}"),
            "End".into(),
            String::new(),
            "Body 1".into(),
            "  Target Bodies(1) = 1".into(),
            "  Equation = 1".into(),
            "  Material = 1".into(),
            "  Body Force = 1".into(),
            "End".into(),
            String::new(),
            "Solver 1".into(),
            "  Equation = Linear elasticity".into(),
            "  Procedure = \"StressSolve\" \"StressSolver\"".into(),
            "  Variable = -dofs 3 Displacement".into(),
            "  Calculate Stresses = True".into(),
            "  Steady State Convergence Tolerance = 1.0e-5".into(),
            "  Nonlinear System Max Iterations = 1".into(),
            "  Linear System Solver = Direct".into(),
        ];
        if self.toolchain.use_mumps {
            lines.push("  Linear System Direct Method = MUMPS".into());
        }
        lines.extend([
            "End".to_string(),
            String::new(),
            "Solver 2".into(),
            "  Equation = SaveScalars".into(),
            "  Exec Solver = After Timestep".into(),
            "  Procedure = File \"SaveData\" \"SaveScalars\"".into(),
            format!("  Filename = {prefix}.dat"),
            "  File Append = False".into(),
            "  Variable 1 = Displacement 2".into(),
            "  Operator 1 = max".into(),
            "  Operator 2 = min".into(),
            format!("  Save Coordinates(1,3) = {} {h} {}", w / 2.0, l / 2.0),
            "End".into(),
            String::new(),
            "Equation 1".into(),
            "  Active Solvers(2) = 1 2".into(),
            "End".into(),
            String::new(),
            "Material 1".into(),
            format!("  Name = \"{}\"", case.material),
            format!("  Youngs modulus = {e}"),
            format!("  Density = {rho}"),
            format!("  Poisson ratio = {}", case.poisson),
            "End".into(),
            String::new(),
            "Body Force 1".into(),
            format!("  Stress Bodyforce 2 = $ -{GRAVITY} * {rho}"),
            "End".into(),
            String::new(),
            "Boundary Condition 1".into(),
            "  Target Boundaries(1) = 1".into(),
            "  Name = \"Wall\"".into(),
            "  Displacement 1 = 0".into(),
            "  Displacement 2 = 0".into(),
            "  Displacement 3 = 0".into(),
            "End".into(),
            String::new(),
            "Boundary Condition 2".into(),
            "  Target Boundaries(1) = 6".into(),
            "  Name = \"Load\"".into(),
            format!("  Force 2 = $ -{p} / {w} / {h}"),
            "End".into(),
        ]);
        lines.join("\n") + "\n"
    }

    /// awk step over the SaveScalars row: columns 1–2 are max/min y
    /// displacement, 8 is stress_zz at the probe, 14–15 the probe's y and z.
    fn extraction_script(case: &BeamCase, ctx: &RunContext) -> String {
        let prefix = &ctx.prefix;
        let (l, h) = (case.length, case.height);
        format!(
            "cd \"{workdir}\"\n\
             awk -v L={l} -v H={h} 'NR == 1 {{\n\
             \x20 a = $1 < 0 ? -$1 : $1; b = $2 < 0 ? -$2 : $2\n\
             \x20 print (a > b ? $1 : $2) > \"{prefix}.displ\"\n\
             \x20 s = $8 < 0 ? -$8 : $8\n\
             \x20 print s * L * H / ((L - $15) * (2 * $14 - H)) > \"{prefix}.stress\"\n\
             }}' {prefix}.dat\n",
            workdir = ctx.workdir.display(),
        )
    }

    fn visualization_script(ctx: &RunContext) -> String {
        let results = ctx.results_dir();
        let post = results.join(post_file_name(ctx));
        let stress_view = results.join(format!("{}_stress.webgl", ctx.prefix));
        let displ_view = results.join(format!("{}_displ.webgl", ctx.prefix));
        let reader = if ctx.resources.is_parallel() {
            "XMLPartitionedUnstructuredGridReader"
        } else {
            "XMLUnstructuredGridReader"
        };
        format!(
            "from paraview.simple import *\n\
             paraview.simple._DisableFirstRenderCameraReset()\n\
             beam = {reader}(FileName=[\"{post}\"])\n\
             view = GetActiveViewOrCreate('RenderView')\n\
             warp = WarpByVector(Input=beam)\n\
             warp.Vectors = ['POINTS', 'displacement']\n\
             display = Show(warp, view)\n\
             ColorBy(display, ('POINTS', 'stress', 'zz'))\n\
             display.SetScalarBarVisibility(view, True)\n\
             view.ResetCamera()\n\
             ExportView(\"{stress}\", view=view)\n\
             ColorBy(display, ('POINTS', 'displacement', 'Y'))\n\
             view.ResetCamera()\n\
             ExportView(\"{displ}\", view=view)\n",
            post = post.display(),
            stress = stress_view.display(),
            displ = displ_view.display(),
        )
    }
}

/// Solver post file: a `.pvtu` index when partitioned.
fn post_file_name(ctx: &RunContext) -> String {
    let extension = if ctx.resources.is_parallel() {
        "pvtu"
    } else {
        "vtu"
    };
    format!("{}0001.{extension}", ctx.prefix)
}

#[async_trait]
impl SolverBackend for ElmerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Elmer
    }

    fn pipeline_shape(&self) -> PipelineShape {
        PipelineShape::MultiStage
    }

    async fn materialize(&self, case: &BeamCase, ctx: &RunContext) -> JobResult<ArtifactSet> {
        let geometry = ctx.file("geo");
        write_artifact(&geometry, &Self::geometry(case)).await?;

        let input_deck = ctx.file("sif");
        write_artifact(&input_deck, &self.input_deck(case, ctx)).await?;

        let extraction_script = ctx.workdir.join(format!("{}_parse.sh", ctx.prefix));
        write_artifact(&extraction_script, &Self::extraction_script(case, ctx)).await?;

        let visualization_script = ctx.file("py");
        write_artifact(&visualization_script, &Self::visualization_script(ctx)).await?;

        let mut extras = Vec::new();
        if ctx.resources.is_parallel() {
            let start_info = ctx.workdir.join("ELMERSOLVER_STARTINFO");
            write_artifact(&start_info, &format!("{}.sif\n1\n", ctx.prefix)).await?;
            extras.push(start_info);
        }

        Ok(ArtifactSet {
            geometry: Some(geometry),
            input_deck,
            extraction_script,
            visualization_script,
            extras,
        })
    }

    fn launch_script(&self, artifacts: &ArtifactSet, ctx: &RunContext) -> LaunchScript {
        let tc = &self.toolchain;
        let prefix = &ctx.prefix;
        let np = ctx.resources.total_processes();
        let name = |path: &Path| -> String {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        let mut script = LaunchScript::new(&ctx.shell);
        script.command(format!("cd \"{}\"", ctx.workdir.display()));
        if let Some(geometry) = &artifacts.geometry {
            script.stage(
                "gmsh",
                format!("{} -3 {} -o {prefix}.msh", tc.gmsh, name(geometry)),
            );
        }

        let mut grid = format!("{} 14 2 {prefix}.msh -autoclean -out {prefix}", tc.elmer_grid);
        if ctx.resources.is_parallel() {
            grid.push_str(&format!(" -metis {np}"));
        }
        script.stage("ElmerGrid", grid);

        let solve = match (ctx.resources.is_parallel(), ctx.mode) {
            (false, _) => format!("{} {}", tc.elmer_solver, name(&artifacts.input_deck)),
            (true, LaunchMode::Local) => {
                format!("{} -np {np} {}", tc.mpirun, tc.elmer_solver_mpi)
            }
            (true, LaunchMode::Scheduler) => format!(
                "{} -np {np} -machinefile $PBS_NODEFILE {}",
                tc.mpirun, tc.elmer_solver_mpi
            ),
        };
        script.stage("ElmerSolver", solve);
        script.stage(
            "extract",
            format!("{} {}", ctx.shell, name(&artifacts.extraction_script)),
        );
        script.stage(
            "paraview",
            format!("{} {}", tc.paraview, name(&artifacts.visualization_script)),
        );
        script
    }

    fn primary_artifact(&self, ctx: &RunContext) -> PathBuf {
        ctx.results_dir().join(post_file_name(ctx))
    }

    fn result_artifacts(&self, ctx: &RunContext) -> Vec<PathBuf> {
        let results = ctx.results_dir();
        vec![
            results.join(format!("{}_stress.webgl", ctx.prefix)),
            results.join(format!("{}_displ.webgl", ctx.prefix)),
        ]
    }

    async fn is_output_healthy(&self, stdout_log: &Path) -> bool {
        match read_optional(stdout_log).await {
            Some(text) => !text.lines().any(|line| ERROR_MARKER.is_match(line)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::sample_case;
    use crate::job::Resources;

    fn ctx(workdir: &Path, resources: Resources) -> RunContext {
        RunContext {
            workdir: workdir.to_path_buf(),
            prefix: "steelbar1".into(),
            resources,
            mode: LaunchMode::Local,
            shell: "/bin/bash".into(),
        }
    }

    #[tokio::test]
    async fn test_materialize_serial() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), Resources::serial());
        let backend = ElmerBackend::new(Toolchain::default());

        let artifacts = backend.materialize(&sample_case(), &ctx).await.unwrap();
        for path in artifacts.paths() {
            assert!(path.exists(), "{}", path.display());
        }
        assert!(artifacts.extras.is_empty());

        let deck = std::fs::read_to_string(&artifacts.input_deck).unwrap();
        assert!(deck.contains("Filename = steelbar1.dat"));
        assert!(!deck.contains("MUMPS"));

        let geo = std::fs::read_to_string(artifacts.geometry.unwrap()).unwrap();
        // 1.0 / 0.01 = 100 elements along the length.
        assert!(geo.contains("Layers{100}"));
    }

    #[tokio::test]
    async fn test_materialize_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), Resources::serial());
        let backend = ElmerBackend::new(Toolchain::default());

        let first = backend.materialize(&sample_case(), &ctx).await.unwrap();
        let deck_1 = std::fs::read_to_string(&first.input_deck).unwrap();
        let second = backend.materialize(&sample_case(), &ctx).await.unwrap();
        let deck_2 = std::fs::read_to_string(&second.input_deck).unwrap();
        assert_eq!(first, second);
        assert_eq!(deck_1, deck_2);
    }

    #[tokio::test]
    async fn test_parallel_run_uses_mpi_and_pvtu() {
        let dir = tempfile::tempdir().unwrap();
        let resources = Resources { cores: 4, machines: 1 };
        let ctx = ctx(dir.path(), resources);
        let toolchain = Toolchain {
            use_mumps: true,
            ..Toolchain::default()
        };
        let backend = ElmerBackend::new(toolchain);

        let artifacts = backend.materialize(&sample_case(), &ctx).await.unwrap();
        assert_eq!(artifacts.extras.len(), 1);
        let start_info = std::fs::read_to_string(&artifacts.extras[0]).unwrap();
        assert_eq!(start_info, "steelbar1.sif\n1\n");

        let script = backend.launch_script(&artifacts, &ctx).render();
        assert!(script.contains("mpirun -np 4 ElmerSolver_mpi"));
        assert!(script.contains("-metis 4"));
        assert!(
            backend
                .primary_artifact(&ctx)
                .ends_with("steelbar1/steelbar10001.pvtu")
        );

        let deck = std::fs::read_to_string(&artifacts.input_deck).unwrap();
        assert!(deck.contains("MUMPS"));
    }

    #[tokio::test]
    async fn test_scheduler_run_uses_nodefile() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path(), Resources { cores: 2, machines: 2 });
        ctx.mode = LaunchMode::Scheduler;
        let backend = ElmerBackend::new(Toolchain::default());

        let artifacts = backend.materialize(&sample_case(), &ctx).await.unwrap();
        let script = backend.launch_script(&artifacts, &ctx).render();
        assert!(script.contains("mpirun -np 4 -machinefile $PBS_NODEFILE ElmerSolver_mpi"));
    }

    #[test]
    fn test_primary_artifact_serial() {
        let ctx = ctx(Path::new("/scratch/steelbar1"), Resources::serial());
        let backend = ElmerBackend::new(Toolchain::default());
        assert_eq!(
            backend.primary_artifact(&ctx),
            PathBuf::from("/scratch/steelbar1/steelbar1/steelbar10001.vtu")
        );
    }

    #[tokio::test]
    async fn test_output_health() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("steelbar1.out");
        let backend = ElmerBackend::new(Toolchain::default());

        assert!(!backend.is_output_healthy(&log).await);

        std::fs::write(&log, "ElmerSolver: ALL DONE\n").unwrap();
        assert!(backend.is_output_healthy(&log).await);

        std::fs::write(&log, "MAIN: Solver FAILED to converge\n").unwrap();
        assert!(!backend.is_output_healthy(&log).await);

        std::fs::write(&log, "ok\nSTAGE FAILED: gmsh (exit 1)\n").unwrap();
        assert!(!backend.is_output_healthy(&log).await);
    }

    #[tokio::test]
    async fn test_run_statistics_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ElmerBackend::new(Toolchain::default());
        let stats = backend.run_statistics(&dir.path().join("x.out")).await;
        assert_eq!(stats, Default::default());
    }
}
