//! Stage descriptors and the generic runner every external step goes through.
//!
//! A stage is data: which tool, which arguments, which file it must leave
//! behind, and what to say when it fails. `StageExecutor` owns the only copy
//! of the control flow: precondition check, launch, exit-code check, output
//! check.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::pathing::path_arg;
use crate::pipeline::runtime::{
    output_tail, CommandSpec, PipelineCommandRunner, PipelineRuntimeError,
};
use crate::pipeline::tools::{ResolvedTools, ToolKind, ToolLocateError};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageArg {
    Literal(String),
    Path(PathBuf),
    /// Every file in `dir` named `prefix*suffix`, sorted, resolved when the
    /// stage runs.
    Matching {
        dir: PathBuf,
        prefix: String,
        suffix: String,
    },
}

impl StageArg {
    pub fn lit(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn path(value: impl Into<PathBuf>) -> Self {
        Self::Path(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub tool: ToolKind,
    pub args: Vec<StageArg>,
    pub expected_output: PathBuf,
    pub failure_message: &'static str,
}

impl StageDescriptor {
    /// True when the expected output is also one of the inputs, as with
    /// ExifTool rewriting a file in place.
    pub fn edits_in_place(&self) -> bool {
        self.args
            .iter()
            .any(|arg| matches!(arg, StageArg::Path(path) if *path == self.expected_output))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePrecondition {
    AlreadySatisfied,
    NeedsExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Executed,
    Skipped,
    /// Failed, but the policy allowed the run to continue without it.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub name: String,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage}: {source}")]
    Tool {
        stage: &'static str,
        #[source]
        source: ToolLocateError,
    },
    #[error("{stage}: {source}")]
    Launch {
        stage: &'static str,
        #[source]
        source: PipelineRuntimeError,
    },
    #[error("{stage}: {message} ({program} exited with code {status_code})\n{stderr}")]
    Failed {
        stage: &'static str,
        message: &'static str,
        program: String,
        status_code: i32,
        stderr: String,
    },
    #[error("{stage}: expected output {path} was not produced")]
    MissingOutput { stage: &'static str, path: PathBuf },
    #[error("{stage}: no input files matching {pattern} in {dir}")]
    NoInputs {
        stage: &'static str,
        dir: PathBuf,
        pattern: String,
    },
    #[error("{stage}: cannot read image {path}: {message}")]
    Image {
        stage: &'static str,
        path: PathBuf,
        message: String,
    },
    #[error("{stage}: {path} is {width}x{height}, not 2:1")]
    AspectRatio {
        stage: &'static str,
        path: PathBuf,
        width: u32,
        height: u32,
    },
    #[error("{stage}: pixel data of {path} changed ({before} -> {after})")]
    PayloadChanged {
        stage: &'static str,
        path: PathBuf,
        before: String,
        after: String,
    },
    #[error("{stage}: filesystem error at {path}: {source}")]
    Io {
        stage: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Tool { stage, .. }
            | Self::Launch { stage, .. }
            | Self::Failed { stage, .. }
            | Self::MissingOutput { stage, .. }
            | Self::NoInputs { stage, .. }
            | Self::Image { stage, .. }
            | Self::AspectRatio { stage, .. }
            | Self::PayloadChanged { stage, .. }
            | Self::Io { stage, .. } => stage,
        }
    }

    pub fn io(stage: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            stage,
            path,
            source,
        }
    }
}

/// With debug-skip on, a stage whose output already exists is satisfied.
pub fn check_precondition(stage: &StageDescriptor, debug_skip: bool) -> StagePrecondition {
    if debug_skip && stage.expected_output.is_file() {
        StagePrecondition::AlreadySatisfied
    } else {
        StagePrecondition::NeedsExecution
    }
}

pub struct StageExecutor<'a, R> {
    runner: &'a R,
    tools: &'a ResolvedTools,
    cwd: PathBuf,
    debug_skip: bool,
}

impl<'a, R> StageExecutor<'a, R>
where
    R: PipelineCommandRunner,
{
    pub fn new(runner: &'a R, tools: &'a ResolvedTools, cwd: PathBuf, debug_skip: bool) -> Self {
        Self {
            runner,
            tools,
            cwd,
            debug_skip,
        }
    }

    pub fn precondition(&self, stage: &StageDescriptor) -> StagePrecondition {
        check_precondition(stage, self.debug_skip)
    }

    /// Precondition check, then execution when needed.
    pub fn run(&self, stage: &StageDescriptor) -> Result<StageReport, StageError> {
        match self.precondition(stage) {
            StagePrecondition::AlreadySatisfied => {
                info!(stage = stage.name, "skipping, output already present");
                Ok(skipped_report(stage))
            }
            StagePrecondition::NeedsExecution => self.execute(stage),
        }
    }

    pub fn run_all(&self, stages: &[StageDescriptor]) -> Result<Vec<StageReport>, StageError> {
        stages.iter().map(|stage| self.run(stage)).collect()
    }

    pub fn build_command(&self, stage: &StageDescriptor) -> Result<CommandSpec, StageError> {
        let tool = self
            .tools
            .require(stage.tool)
            .map_err(|source| StageError::Tool {
                stage: stage.name,
                source,
            })?;
        let mut args = Vec::with_capacity(stage.args.len());
        for arg in &stage.args {
            match arg {
                StageArg::Literal(value) => args.push(value.clone()),
                StageArg::Path(path) => args.push(path_arg(path.as_path())),
                StageArg::Matching {
                    dir,
                    prefix,
                    suffix,
                } => {
                    let matched = matching_files(dir.as_path(), prefix, suffix)
                        .map_err(StageError::io(stage.name, dir.as_path()))?;
                    if matched.is_empty() {
                        return Err(StageError::NoInputs {
                            stage: stage.name,
                            dir: dir.clone(),
                            pattern: format!("{prefix}*{suffix}"),
                        });
                    }
                    args.extend(matched.iter().map(|p| path_arg(p.as_path())));
                }
            }
        }
        Ok(CommandSpec {
            program: tool.path.clone(),
            args,
            cwd: self.cwd.clone(),
        })
    }

    /// Runs the stage unconditionally. The expected output must be written
    /// by this launch: an older copy is removed first, and a non-zero exit
    /// removes any partial one so a later debug-skip run does not mistake it
    /// for a result.
    pub fn execute(&self, stage: &StageDescriptor) -> Result<StageReport, StageError> {
        let spec = self.build_command(stage)?;
        let command = spec.display_line();
        if !stage.edits_in_place() && stage.expected_output.is_file() {
            debug!(stage = stage.name, "removing stale output before launch");
            fs::remove_file(stage.expected_output.as_path())
                .map_err(StageError::io(stage.name, stage.expected_output.as_path()))?;
        }
        info!(stage = stage.name, "running {}", stage.tool.as_str());
        debug!(stage = stage.name, command = command.as_str(), "command line");

        let started = Instant::now();
        let output = self
            .runner
            .run(&spec)
            .map_err(|source| StageError::Launch {
                stage: stage.name,
                source,
            })?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if !output.success() {
            if stage.expected_output.is_file() {
                let _ = fs::remove_file(stage.expected_output.as_path());
            }
            let stderr = if output.stderr.trim().is_empty() {
                output_tail(output.stdout.as_str(), STDERR_TAIL_LINES)
            } else {
                output_tail(output.stderr.as_str(), STDERR_TAIL_LINES)
            };
            return Err(StageError::Failed {
                stage: stage.name,
                message: stage.failure_message,
                program: stage.tool.as_str().to_string(),
                status_code: output.status_code,
                stderr,
            });
        }
        if !stage.expected_output.is_file() {
            return Err(StageError::MissingOutput {
                stage: stage.name,
                path: stage.expected_output.clone(),
            });
        }

        Ok(StageReport {
            name: stage.name.to_string(),
            outcome: StageOutcome::Executed,
            command: Some(command),
            output: path_arg(stage.expected_output.as_path()),
            duration_ms,
        })
    }
}

pub fn skipped_report(stage: &StageDescriptor) -> StageReport {
    StageReport {
        name: stage.name.to_string(),
        outcome: StageOutcome::Skipped,
        command: None,
        output: path_arg(stage.expected_output.as_path()),
        duration_ms: 0,
    }
}

pub fn matching_files(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(prefix) && n.ends_with(suffix))
            .unwrap_or(false);
        if matches && path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
