//! Commercial pipeline: one ANSYS MAPDL batch run builds, meshes and solves
//! the beam, then a post-processing macro writes the scalar results and a
//! surface CSV that ParaView renders.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{
    ArtifactSet, BackendKind, LaunchScript, PipelineShape, RunContext, RunStatistics,
    STAGE_FAILED_MARKER, SolverBackend, read_optional, write_artifact,
};
use crate::case::{BeamCase, GRAVITY};
use crate::config::Toolchain;
use crate::error::JobResult;
use crate::launcher::LaunchMode;

static ERROR_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"NUMBER OF ERROR\s+MESSAGES ENCOUNTERED=\s*(\d+)").expect("static regex")
});

/// Number after the first `=` on a line.
static ASSIGNED_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\s*([-+0-9.Ee]+)").expect("static regex"));

/// ANSYS MAPDL adapter.
#[derive(Debug, Clone)]
pub struct AnsysBackend {
    toolchain: Toolchain,
}

impl AnsysBackend {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    /// SOLID185 bricks, split at mid-span and mid-width so nodes land on the
    /// probe locations, SURF154 at the free end to carry the traction.
    fn input_deck(case: &BeamCase, ctx: &RunContext) -> String {
        let (l, w, h) = (case.length, case.width, case.height);
        let pressure = -case.load / w / h;
        [
            "/prep7".to_string(),
            "et,1,185".into(),
            format!("mp,ex,1,{}", case.modulus),
            format!("mp,nuxy,1,{}", case.poisson),
            format!("mp,dens,1,{}", case.density),
            "et,2,154".into(),
            "keyopt,2,2,1".into(),
            "keyopt,2,4,1".into(),
            "keyopt,2,11,2".into(),
            format!("block,,{w},,{h},,{l}"),
            format!("wpave,{},,", w / 2.0),
            "wprota,,,90".into(),
            "vsbw,all,,del".into(),
            format!("wpave,,,{}", l / 2.0),
            "wprota,,,-90".into(),
            "vsbw,all,,del".into(),
            "allsel,all".into(),
            "vatt,1,1,1".into(),
            format!("esize,{}", case.mesh_size),
            "mshape,0".into(),
            "mshkey,1".into(),
            "vmesh,all".into(),
            "nsel,s,loc,z,0".into(),
            "d,all,all".into(),
            format!("asel,s,loc,z,{l}"),
            "nsla,s,1".into(),
            "type,2".into(),
            "mat,2".into(),
            "esurf".into(),
            "esel,s,type,,2".into(),
            format!("sfe,all,2,pres,1,{pressure}"),
            "allsel,all".into(),
            format!("acel,,{GRAVITY},"),
            "fini".into(),
            "/solution".into(),
            "solve".into(),
            "fini".into(),
            format!("/input,{}_post,mac", ctx.prefix),
        ]
        .join("\n")
            + "\n"
    }

    /// Probe mid-span stress and tip displacement, scale the probe stress to
    /// the wall, and dump surface nodes for rendering.
    fn extraction_macro(case: &BeamCase, ctx: &RunContext) -> String {
        let prefix = &ctx.prefix;
        let (l, w, h) = (case.length, case.width, case.height);
        let weight = case.weight();
        // Wall-to-probe moment ratio for a tip load plus self-weight.
        let scaling = if weight > 0.0 {
            let alpha = case.load / weight;
            format!("stress*(2*{alpha}+1)/((1-zr)*(2*{alpha}+1-zr))")
        } else {
            "stress/(1-zr)".to_string()
        };
        [
            "/post1".to_string(),
            "set,1".into(),
            format!("nsel,s,loc,x,{}", w / 2.0),
            format!("nsel,r,loc,y,{h}"),
            format!("nsel,r,loc,z,{}", l / 2.0),
            "*get,stress_node,node,,num,min".into(),
            "*get,stress,node,stress_node,s,z".into(),
            "*get,stress_z,node,stress_node,loc,z".into(),
            format!("zr=stress_z/{l}"),
            format!("nsel,s,loc,x,{w}"),
            format!("nsel,r,loc,y,{h}"),
            format!("nsel,r,loc,z,{l}"),
            "*get,displ_node,node,,num,min".into(),
            "*get,displ,node,displ_node,u,y".into(),
            format!("*cfopen,{prefix},stress"),
            format!("*vwrite,{scaling}"),
            "%G".into(),
            "*cfclos".into(),
            format!("*cfopen,{prefix},displ"),
            "*vwrite,displ".into(),
            "%G".into(),
            "*cfclos".into(),
            "asel,s,all".into(),
            "nsla,s,1".into(),
            "*get,nmax,node,,num,max".into(),
            "*dim,nmask,array,nmax".into(),
            "*dim,narray,array,nmax,7".into(),
            "*vget,nmask(1),node,1,nsel".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,1),node,1,loc,x".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,2),node,1,loc,y".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,3),node,1,loc,z".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,4),node,1,u,x".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,5),node,1,u,y".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,6),node,1,u,z".into(),
            "*vmask,nmask(1)".into(),
            "*vget,narray(1,7),node,1,s,z".into(),
            format!("*cfopen,{prefix},csv"),
            "*vmask,nmask(1)".into(),
            "*vwrite,narray(1,1),narray(1,2),narray(1,3),narray(1,4),narray(1,5),narray(1,6),narray(1,7)"
                .into(),
            "%G,%G,%G,%G,%G,%G,%G".into(),
            "*cfclos".into(),
            "fini".into(),
        ]
        .join("\n")
            + "\n"
    }

    /// Delaunay surface from the node CSV, colored by stress then by y
    /// displacement.
    fn visualization_script(ctx: &RunContext) -> String {
        format!(
            "from paraview.simple import *\n\
             paraview.simple._DisableFirstRenderCameraReset()\n\
             beam = CSVReader(FileName=[\"{csv}\"])\n\
             beam.HaveHeaders = 0\n\
             view = GetActiveViewOrCreate('RenderView')\n\
             points = TableToPoints(Input=beam)\n\
             points.XColumn = 'Field 0'\n\
             points.YColumn = 'Field 1'\n\
             points.ZColumn = 'Field 2'\n\
             mesh = Delaunay3D(Input=points)\n\
             display = Show(mesh, view)\n\
             ColorBy(display, ('POINTS', 'Field 6'))\n\
             display.SetScalarBarVisibility(view, True)\n\
             view.ResetCamera()\n\
             ExportView(\"{stress}\", view=view)\n\
             ColorBy(display, ('POINTS', 'Field 4'))\n\
             ExportView(\"{displ}\", view=view)\n",
            csv = ctx.file("csv").display(),
            stress = ctx.workdir.join(format!("{}_stress.webgl", ctx.prefix)).display(),
            displ = ctx.workdir.join(format!("{}_displ.webgl", ctx.prefix)).display(),
        )
    }
}

#[async_trait]
impl SolverBackend for AnsysBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ansys
    }

    fn pipeline_shape(&self) -> PipelineShape {
        PipelineShape::Short
    }

    async fn materialize(&self, case: &BeamCase, ctx: &RunContext) -> JobResult<ArtifactSet> {
        let input_deck = ctx.file("dat");
        write_artifact(&input_deck, &Self::input_deck(case, ctx)).await?;

        let extraction_script = ctx.workdir.join(format!("{}_post.mac", ctx.prefix));
        write_artifact(&extraction_script, &Self::extraction_macro(case, ctx)).await?;

        let visualization_script = ctx.file("py");
        write_artifact(&visualization_script, &Self::visualization_script(ctx)).await?;

        Ok(ArtifactSet {
            geometry: None,
            input_deck,
            extraction_script,
            visualization_script,
            extras: Vec::new(),
        })
    }

    fn launch_script(&self, artifacts: &ArtifactSet, ctx: &RunContext) -> LaunchScript {
        let tc = &self.toolchain;
        let file_name = |path: &Path| -> String {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let deck = file_name(&artifacts.input_deck);

        let mut script = LaunchScript::new(&ctx.shell);
        script.command(format!("cd \"{}\"", ctx.workdir.display()));
        match ctx.mode {
            LaunchMode::Local => {
                script.stage(
                    "ansys",
                    format!("{} -b -np {} -I {deck}", tc.ansys, ctx.resources.cores),
                );
            }
            LaunchMode::Scheduler => {
                script.command(
                    "machines=$(uniq -c \"$PBS_NODEFILE\" | awk '{print $2 \":\" $1}' | paste -s -d ':')",
                );
                script.stage(
                    "ansys",
                    format!("{} -b -dis -machines \"$machines\" -I {deck}", tc.ansys),
                );
            }
        }
        script.stage(
            "paraview",
            format!("{} {}", tc.paraview, file_name(&artifacts.visualization_script)),
        );
        script
    }

    fn primary_artifact(&self, ctx: &RunContext) -> PathBuf {
        ctx.workdir.join(format!("{}_stress.webgl", ctx.prefix))
    }

    fn result_artifacts(&self, ctx: &RunContext) -> Vec<PathBuf> {
        vec![
            ctx.workdir.join(format!("{}_stress.webgl", ctx.prefix)),
            ctx.workdir.join(format!("{}_displ.webgl", ctx.prefix)),
        ]
    }

    async fn is_output_healthy(&self, stdout_log: &Path) -> bool {
        let Some(text) = read_optional(stdout_log).await else {
            return false;
        };
        !text.lines().any(|line| {
            line.contains("*** ERROR ***")
                || line.contains(STAGE_FAILED_MARKER)
                || ERROR_SUMMARY
                    .captures(line)
                    .and_then(|c| c[1].parse::<u64>().ok())
                    .is_some_and(|errors| errors > 0)
        })
    }

    async fn run_statistics(&self, stdout_log: &Path) -> RunStatistics {
        let mut stats = RunStatistics::default();
        let Some(text) = read_optional(stdout_log).await else {
            return stats;
        };
        for line in text.lines() {
            let Some(value) = ASSIGNED_NUMBER.captures(line).map(|c| c[1].to_string()) else {
                continue;
            };
            if line.contains("MAXIMUM NODE NUMBER") {
                stats.nodes = value.parse().ok();
            } else if line.contains("MAXIMUM ELEMENT NUMBER") {
                stats.elements = value.parse().ok();
            } else if line.contains("CP Time") {
                stats.cpu_time_secs = value.parse().ok();
            } else if line.contains("Elapsed Time") {
                stats.wall_time_secs = value.parse().ok();
            }
        }
        stats
    }
}
