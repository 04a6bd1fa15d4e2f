//! Hugin chain: project, control points, cleanup, optimisation, canvas,
//! remap, blend. Every step writes its own file so an interrupted run can be
//! resumed with debug-skip.

use std::path::{Path, PathBuf};

use crate::pipeline::runtime::PipelineCommandRunner;
use crate::pipeline::stages::{StageArg, StageDescriptor, StageError, StageExecutor, StageReport};
use crate::pipeline::tools::ToolKind;

pub const PROJECT_FILE: &str = "pano.pto";
pub const CONTROL_POINTS_FILE: &str = "pano_cp.pto";
pub const CLEANED_FILE: &str = "pano_clean.pto";
pub const OPTIMISED_FILE: &str = "pano_opt.pto";
pub const FINAL_PROJECT_FILE: &str = "pano_final.pto";
pub const REMAP_PREFIX: &str = "remap";
pub const STITCHED_FILE: &str = "stitched.tif";

/// nona writes one tile per source image, numbered from zero.
pub fn remap_tile_name(index: usize) -> String {
    format!("{REMAP_PREFIX}{index:04}.tif")
}

/// Ordered descriptors for the stitch chain inside `work_dir`. The remap
/// step counts as finished only once the last image's tile exists, so an
/// interrupted nona run is redone rather than blended.
pub fn stitch_stages(work_dir: &Path, images: &[PathBuf]) -> Vec<StageDescriptor> {
    let at = |name: &str| work_dir.join(name);

    let mut project_args = vec![StageArg::lit("-o"), StageArg::path(at(PROJECT_FILE))];
    project_args.extend(images.iter().cloned().map(StageArg::Path));

    vec![
        StageDescriptor {
            name: "generate-project",
            tool: ToolKind::PtoGen,
            args: project_args,
            expected_output: at(PROJECT_FILE),
            failure_message: "could not create the Hugin project from the source images",
        },
        StageDescriptor {
            name: "find-control-points",
            tool: ToolKind::Cpfind,
            args: vec![
                StageArg::lit("--multirow"),
                StageArg::lit("-o"),
                StageArg::path(at(CONTROL_POINTS_FILE)),
                StageArg::path(at(PROJECT_FILE)),
            ],
            expected_output: at(CONTROL_POINTS_FILE),
            failure_message: "control point detection failed",
        },
        StageDescriptor {
            name: "clean-control-points",
            tool: ToolKind::Cpclean,
            args: vec![
                StageArg::lit("-o"),
                StageArg::path(at(CLEANED_FILE)),
                StageArg::path(at(CONTROL_POINTS_FILE)),
            ],
            expected_output: at(CLEANED_FILE),
            failure_message: "control point cleanup failed",
        },
        StageDescriptor {
            name: "optimise",
            tool: ToolKind::Autooptimiser,
            args: vec![
                StageArg::lit("-a"),
                StageArg::lit("-m"),
                StageArg::lit("-l"),
                StageArg::lit("-s"),
                StageArg::lit("-o"),
                StageArg::path(at(OPTIMISED_FILE)),
                StageArg::path(at(CLEANED_FILE)),
            ],
            expected_output: at(OPTIMISED_FILE),
            failure_message: "geometric and photometric optimisation failed",
        },
        StageDescriptor {
            name: "set-canvas",
            tool: ToolKind::PanoModify,
            args: vec![
                // 2 is Hugin's equirectangular projection.
                StageArg::lit("--projection=2"),
                StageArg::lit("--fov=360x180"),
                StageArg::lit("--canvas=AUTO"),
                StageArg::lit("--crop=AUTO"),
                StageArg::lit("-o"),
                StageArg::path(at(FINAL_PROJECT_FILE)),
                StageArg::path(at(OPTIMISED_FILE)),
            ],
            expected_output: at(FINAL_PROJECT_FILE),
            failure_message: "setting the equirectangular canvas failed",
        },
        StageDescriptor {
            name: "remap",
            tool: ToolKind::Nona,
            args: vec![
                StageArg::lit("-m"),
                StageArg::lit("TIFF_m"),
                StageArg::lit("-o"),
                StageArg::path(at(REMAP_PREFIX)),
                StageArg::path(at(FINAL_PROJECT_FILE)),
            ],
            expected_output: at(&remap_tile_name(images.len().saturating_sub(1))),
            failure_message: "remapping images onto the canvas failed",
        },
        StageDescriptor {
            name: "blend",
            tool: ToolKind::Enblend,
            args: vec![
                StageArg::lit("-o"),
                StageArg::path(at(STITCHED_FILE)),
                StageArg::Matching {
                    dir: work_dir.to_path_buf(),
                    prefix: REMAP_PREFIX.to_string(),
                    suffix: String::from(".tif"),
                },
            ],
            expected_output: at(STITCHED_FILE),
            failure_message: "blending the remapped images failed",
        },
    ]
}

pub struct StitchResult {
    pub stitched: PathBuf,
    pub reports: Vec<StageReport>,
}

pub fn run_stitch<R: PipelineCommandRunner>(
    executor: &StageExecutor<'_, R>,
    work_dir: &Path,
    images: &[PathBuf],
) -> Result<StitchResult, StageError> {
    let reports = executor.run_all(&stitch_stages(work_dir, images))?;
    Ok(StitchResult {
        stitched: work_dir.join(STITCHED_FILE),
        reports,
    })
}
