use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::pipeline::config::SkyFillPolicy;
use crate::pipeline::pathing::path_arg;
use crate::pipeline::runtime::PipelineCommandRunner;
use crate::pipeline::stages::{
    StageArg, StageDescriptor, StageError, StageExecutor, StageOutcome, StageReport,
};
use crate::pipeline::tools::ToolKind;

const STAGE: &str = "sky-fill";

/// SkyFill names its output after the input: `resized.jpg` -> `resized-filled.jpg`.
pub fn filled_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}-filled.jpg"))
}

pub fn skyfill_stage(resized: &Path, quality: u8) -> StageDescriptor {
    StageDescriptor {
        name: STAGE,
        tool: ToolKind::SkyFill,
        args: vec![
            StageArg::lit("-quality"),
            StageArg::Literal(quality.to_string()),
            // GPano tags are written later with the real dimensions.
            StageArg::lit("-no-gpano-xmp"),
            StageArg::lit("-out"),
            StageArg::lit("jpeg"),
            StageArg::path(resized),
        ],
        expected_output: filled_path(resized),
        failure_message: "sky fill failed",
    }
}

pub struct SkyFillResult {
    pub filled: PathBuf,
    pub report: StageReport,
}

pub fn run_skyfill<R: PipelineCommandRunner>(
    executor: &StageExecutor<'_, R>,
    resized: &Path,
    quality: u8,
    policy: SkyFillPolicy,
) -> Result<SkyFillResult, StageError> {
    let stage = skyfill_stage(resized, quality);
    let filled = stage.expected_output.clone();
    match executor.run(&stage) {
        Ok(report) => Ok(SkyFillResult { filled, report }),
        Err(err) if policy == SkyFillPolicy::BestEffort && recoverable(&err) => {
            warn!(stage = STAGE, "continuing without sky fill: {err}");
            fs::copy(resized, filled.as_path()).map_err(StageError::io(STAGE, filled.as_path()))?;
            Ok(SkyFillResult {
                report: StageReport {
                    name: STAGE.to_string(),
                    outcome: StageOutcome::Degraded,
                    command: None,
                    output: path_arg(filled.as_path()),
                    duration_ms: 0,
                },
                filled,
            })
        }
        Err(err) => Err(err),
    }
}

/// Tool trouble may be tolerated; a missing tool registration may not.
fn recoverable(err: &StageError) -> bool {
    matches!(
        err,
        StageError::Failed { .. } | StageError::MissingOutput { .. } | StageError::Launch { .. }
    )
}
