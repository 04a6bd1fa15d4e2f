//! GPano XMP tagging. Only metadata may change: the decoded pixels are
//! hashed before and after ExifTool touches the file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::pipeline::digest::sha256_parts;
use crate::pipeline::runtime::PipelineCommandRunner;
use crate::pipeline::stages::{
    skipped_report, StageArg, StageDescriptor, StageError, StageExecutor, StagePrecondition,
    StageReport,
};
use crate::pipeline::tools::ToolKind;

pub const TAGGED_FILE: &str = "tagged.jpg";
const STAGE: &str = "inject-metadata";
const PUBLISH_STAGE: &str = "publish";

/// Full and cropped sizes are equal: the image covers the whole sphere.
pub fn gpano_args(width: u32, height: u32) -> Vec<String> {
    vec![
        String::from("-XMP-GPano:UsePanoramaViewer=True"),
        String::from("-XMP-GPano:ProjectionType=equirectangular"),
        format!("-XMP-GPano:FullPanoWidthPixels={width}"),
        format!("-XMP-GPano:FullPanoHeightPixels={height}"),
        format!("-XMP-GPano:CroppedAreaImageWidthPixels={width}"),
        format!("-XMP-GPano:CroppedAreaImageHeightPixels={height}"),
        String::from("-XMP-GPano:CroppedAreaLeftPixels=0"),
        String::from("-XMP-GPano:CroppedAreaTopPixels=0"),
    ]
}

pub fn metadata_stage(tagged: &Path, width: u32, height: u32) -> StageDescriptor {
    let mut args = vec![StageArg::lit("-overwrite_original")];
    args.extend(gpano_args(width, height).into_iter().map(StageArg::Literal));
    args.push(StageArg::path(tagged));
    StageDescriptor {
        name: STAGE,
        tool: ToolKind::ExifTool,
        args,
        expected_output: tagged.to_path_buf(),
        failure_message: "writing panorama metadata failed",
    }
}

/// SHA-256 over the decoded RGB buffer plus its dimensions.
pub fn pixel_digest(path: &Path) -> Result<String, StageError> {
    let img = image::open(path).map_err(|err| StageError::Image {
        stage: STAGE,
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let rgb = img.to_rgb8();
    let width = rgb.width().to_le_bytes();
    let height = rgb.height().to_le_bytes();
    Ok(sha256_parts([
        width.as_slice(),
        height.as_slice(),
        rgb.as_raw().as_slice(),
    ]))
}

pub struct MetadataResult {
    pub tagged: PathBuf,
    pub report: StageReport,
}

pub fn run_metadata<R: PipelineCommandRunner>(
    executor: &StageExecutor<'_, R>,
    filled: &Path,
    work_dir: &Path,
    dimensions: (u32, u32),
    verify_payload: bool,
) -> Result<MetadataResult, StageError> {
    let tagged = work_dir.join(TAGGED_FILE);
    let stage = metadata_stage(tagged.as_path(), dimensions.0, dimensions.1);
    if executor.precondition(&stage) == StagePrecondition::AlreadySatisfied {
        info!(stage = STAGE, "skipping, output already present");
        return Ok(MetadataResult {
            report: skipped_report(&stage),
            tagged,
        });
    }

    fs::copy(filled, tagged.as_path()).map_err(StageError::io(STAGE, tagged.as_path()))?;
    let result = tag_and_verify(executor, &stage, verify_payload);
    if result.is_err() {
        // A half-tagged file must not satisfy the next debug-skip run.
        let _ = fs::remove_file(tagged.as_path());
    }
    Ok(MetadataResult {
        report: result?,
        tagged,
    })
}

fn tag_and_verify<R: PipelineCommandRunner>(
    executor: &StageExecutor<'_, R>,
    stage: &StageDescriptor,
    verify_payload: bool,
) -> Result<StageReport, StageError> {
    let path = stage.expected_output.as_path();
    let before = if verify_payload {
        Some(pixel_digest(path)?)
    } else {
        None
    };
    let report = executor.execute(stage)?;
    if let Some(before) = before {
        let after = pixel_digest(path)?;
        if after != before {
            return Err(StageError::PayloadChanged {
                stage: STAGE,
                path: path.to_path_buf(),
                before,
                after,
            });
        }
        debug!(stage = STAGE, digest = before.as_str(), "pixel data unchanged");
    }
    Ok(report)
}

/// Copies the tagged image to its final location.
pub fn publish(tagged: &Path, output: &Path) -> Result<(), StageError> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(StageError::io(PUBLISH_STAGE, parent))?;
    }
    fs::copy(tagged, output).map_err(StageError::io(PUBLISH_STAGE, output))?;
    Ok(())
}
