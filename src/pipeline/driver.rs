//! Linear state machine from an image folder to a published panorama.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::config::PipelineConfig;
use crate::pipeline::fetch::sources::FetchSource;
use crate::pipeline::fetch::{ArchiveDownloader, FetchError, ToolFetcher};
use crate::pipeline::metadata::{publish, run_metadata};
use crate::pipeline::pathing::{
    load_image_set, output_file_name, path_arg, run_summary_file_name, InputError,
};
use crate::pipeline::resize::run_resize;
use crate::pipeline::runlog::{
    timestamp_now, write_pretty_json_with_newline, RunLogError, RunSummary,
};
use crate::pipeline::runtime::PipelineCommandRunner;
use crate::pipeline::settings_layer::PipelineSettingsLayerError;
use crate::pipeline::skyfill::run_skyfill;
use crate::pipeline::stages::{StageError, StageExecutor};
use crate::pipeline::stitch::run_stitch;
use crate::pipeline::tools::{ToolKind, ToolLocateError, ToolLocator, ToolOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    ValidatingInput,
    LocatingTools,
    FetchingDeps,
    Stitching,
    Resizing,
    SkyFilling,
    InjectingMetadata,
    Done,
    Error,
}

impl PipelineState {
    pub const ORDER: [Self; 8] = [
        Self::ValidatingInput,
        Self::LocatingTools,
        Self::FetchingDeps,
        Self::Stitching,
        Self::Resizing,
        Self::SkyFilling,
        Self::InjectingMetadata,
        Self::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidatingInput => "validating-input",
            Self::LocatingTools => "locating-tools",
            Self::FetchingDeps => "fetching-deps",
            Self::Stitching => "stitching",
            Self::Resizing => "resizing",
            Self::SkyFilling => "sky-filling",
            Self::InjectingMetadata => "injecting-metadata",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Tool(#[from] ToolLocateError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Settings(#[from] PipelineSettingsLayerError),
    #[error(transparent)]
    RunLog(#[from] RunLogError),
    #[error("failed to prepare directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download client unavailable: {0}")]
    Downloader(String),
    #[error("working directory {work_dir} contains {other}; refusing to clear it")]
    WorkDirOverlap { work_dir: PathBuf, other: PathBuf },
}

/// A pipeline failure tagged with the state it happened in.
#[derive(Debug, Error)]
#[error("{state} failed: {source}")]
pub struct RunError {
    pub state: PipelineState,
    #[source]
    pub source: PipelineError,
}

impl RunError {
    pub fn new(state: PipelineState, source: impl Into<PipelineError>) -> Self {
        Self {
            state,
            source: source.into(),
        }
    }
}

fn failed_in<E: Into<PipelineError>>(state: PipelineState) -> impl FnOnce(E) -> RunError {
    move |source| RunError::new(state, source)
}

fn dir_error(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError {
    let path = path.to_path_buf();
    move |source| PipelineError::Io { path, source }
}

/// A run without debug-skip starts from an empty working directory, so
/// nothing an earlier run left behind can be blended in or taken for a
/// stage's output. With debug-skip those files are what gets reused.
fn prepare_work_dir(config: &PipelineConfig) -> Result<(), PipelineError> {
    let work_dir = config.work_dir.as_path();
    if !config.debug_skip && work_dir.exists() {
        let guarded = [
            config.input_dir.as_path(),
            config.output_dir.as_path(),
            config.tooling.tools_dir.as_path(),
        ];
        if let Some(other) = guarded.into_iter().find(|p| p.starts_with(work_dir)) {
            return Err(PipelineError::WorkDirOverlap {
                work_dir: work_dir.to_path_buf(),
                other: other.to_path_buf(),
            });
        }
        info!(work_dir = %work_dir.display(), "clearing working directory");
        fs::remove_dir_all(work_dir).map_err(dir_error(work_dir))?;
    }
    fs::create_dir_all(work_dir).map_err(dir_error(work_dir))
}

fn enter(state: PipelineState) {
    info!(state = state.as_str(), "entering state");
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output: PathBuf,
    pub summary_path: PathBuf,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub tool: ToolKind,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ToolOrigin>,
    pub mandatory: bool,
    /// Can be downloaded on demand on this platform.
    pub fetchable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub struct PanoramaPipeline<R, D> {
    config: PipelineConfig,
    runner: R,
    locator: ToolLocator,
    fetcher: ToolFetcher<D>,
}

impl<R, D> PanoramaPipeline<R, D>
where
    R: PipelineCommandRunner,
    D: ArchiveDownloader,
{
    pub fn new(config: PipelineConfig, runner: R, downloader: D) -> Self {
        let locator = ToolLocator::new(config.tooling.search.clone());
        let fetcher = ToolFetcher::new(
            downloader,
            config.tooling.tools_dir.clone(),
            config.tooling.fetch.clone(),
            config.tooling.search.platform,
        );
        Self {
            config,
            runner,
            locator,
            fetcher,
        }
    }

    pub fn with_fetch_source(mut self, kind: ToolKind, source: FetchSource) -> Self {
        self.fetcher = self.fetcher.with_source(kind, source);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reports every tool without downloading anything.
    pub fn check_tools(&self) -> Vec<ToolStatus> {
        ToolKind::MANDATORY
            .into_iter()
            .chain(ToolKind::FETCHABLE)
            .map(|kind| {
                let found = self.fetcher.find_existing(kind, &self.locator);
                let fetchable = self.fetcher.has_source(kind);
                ToolStatus {
                    tool: kind,
                    found: found.is_some(),
                    path: found.as_ref().map(|t| path_arg(t.path.as_path())),
                    origin: found.as_ref().map(|t| t.origin),
                    mandatory: ToolKind::MANDATORY.contains(&kind),
                    fetchable,
                    hint: (found.is_none() && !fetchable).then(|| kind.install_hint().to_string()),
                }
            })
            .collect()
    }

    pub fn run(&self) -> Result<RunOutcome, RunError> {
        let config = &self.config;
        let started_at = timestamp_now();

        enter(PipelineState::ValidatingInput);
        let image_set = load_image_set(
            config.input_dir.as_path(),
            config.expected_image_count,
            config.strict_image_count,
        )
        .map_err(failed_in(PipelineState::ValidatingInput))?;
        info!(
            folder = image_set.folder_name.as_str(),
            images = image_set.images.len(),
            "input validated"
        );

        enter(PipelineState::LocatingTools);
        let mut tools = self
            .locator
            .locate_mandatory()
            .map_err(failed_in(PipelineState::LocatingTools))?;

        enter(PipelineState::FetchingDeps);
        for kind in ToolKind::FETCHABLE {
            let tool = self
                .fetcher
                .ensure(kind, &self.locator)
                .map_err(failed_in(PipelineState::FetchingDeps))?;
            tools.insert(tool);
        }

        enter(PipelineState::Stitching);
        prepare_work_dir(config).map_err(failed_in(PipelineState::Stitching))?;
        fs::create_dir_all(config.output_dir.as_path())
            .map_err(dir_error(config.output_dir.as_path()))
            .map_err(failed_in(PipelineState::Stitching))?;
        let work_dir = config.work_dir.as_path();
        let executor =
            StageExecutor::new(&self.runner, &tools, config.work_dir.clone(), config.debug_skip);
        let stitch = run_stitch(&executor, work_dir, &image_set.images)
            .map_err(failed_in(PipelineState::Stitching))?;
        let mut stages = stitch.reports;

        enter(PipelineState::Resizing);
        let resized = run_resize(
            &executor,
            stitch.stitched.as_path(),
            work_dir,
            config.resize_quality,
        )
        .map_err(failed_in(PipelineState::Resizing))?;
        stages.push(resized.report);

        enter(PipelineState::SkyFilling);
        let filled = run_skyfill(
            &executor,
            resized.resized.as_path(),
            config.skyfill_quality,
            config.skyfill_policy,
        )
        .map_err(failed_in(PipelineState::SkyFilling))?;
        stages.push(filled.report);

        enter(PipelineState::InjectingMetadata);
        let tagged = run_metadata(
            &executor,
            filled.filled.as_path(),
            work_dir,
            (resized.width, resized.height),
            config.verify_payload,
        )
        .map_err(failed_in(PipelineState::InjectingMetadata))?;
        stages.push(tagged.report);

        let output = config
            .output_dir
            .join(output_file_name(image_set.folder_name.as_str()));
        publish(tagged.tagged.as_path(), output.as_path())
            .map_err(failed_in(PipelineState::InjectingMetadata))?;

        let summary = RunSummary {
            input_dir: path_arg(config.input_dir.as_path()),
            folder_name: image_set.folder_name.clone(),
            image_count: image_set.images.len(),
            output: path_arg(output.as_path()),
            width: resized.width,
            height: resized.height,
            platform: config.tooling.search.platform.as_str().to_string(),
            debug_skip: config.debug_skip,
            skyfill_policy: config.skyfill_policy.as_str().to_string(),
            started_at,
            finished_at: timestamp_now(),
            tools: tools.clone(),
            stages,
        };
        let summary_path = config
            .output_dir
            .join(run_summary_file_name(image_set.folder_name.as_str()));
        write_pretty_json_with_newline(summary_path.as_path(), &summary)
            .map_err(failed_in(PipelineState::InjectingMetadata))?;

        enter(PipelineState::Done);
        self.cleanup(work_dir);
        Ok(RunOutcome {
            output,
            summary_path,
            summary,
        })
    }

    fn cleanup(&self, work_dir: &Path) {
        if self.config.debug_skip || self.config.keep_work_dir {
            info!(work_dir = %work_dir.display(), "keeping working directory");
            return;
        }
        if let Err(err) = fs::remove_dir_all(work_dir) {
            warn!(work_dir = %work_dir.display(), "could not remove working directory: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::{Os, Platform, ToolSearch};
    use crate::pipeline::settings_layer::PanoSettingsOverlay;
    use crate::pipeline::stages::test_support::{
        failed, ok, program_name, temp_dir, touch_output_of, write_image, FakeRunner,
    };
    use crate::pipeline::stages::StageOutcome;
    use crate::pipeline::runtime::CommandSpec;
    use std::sync::{Arc, Mutex};

    struct NoDownloads {
        calls: Arc<Mutex<u32>>,
    }

    impl ArchiveDownloader for NoDownloads {
        fn download(&self, _url: &str, _dest: &Path) -> Result<u64, String> {
            *self.calls.lock().expect("calls mutex") += 1;
            Err(String::from("offline"))
        }
    }

    fn install_fake_tools(bin: &Path, kinds: impl IntoIterator<Item = ToolKind>) {
        fs::create_dir_all(bin).expect("bin dir");
        for kind in kinds {
            let path = bin.join(kind.as_str());
            fs::write(path.as_path(), b"#!/bin/sh\n").expect("fake tool");
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path.as_path(), fs::Permissions::from_mode(0o755))
                    .expect("chmod");
            }
        }
    }

    /// Behaves like the real tool chain, writing plausible outputs.
    fn simulate(spec: &CommandSpec) -> crate::pipeline::runtime::CommandOutput {
        match program_name(spec).as_str() {
            "magick" => {
                let out = spec.args.last().expect("output last");
                write_image(Path::new(out), 64, 32);
            }
            "skyfill" => {
                let input = spec.args.last().expect("input last");
                let filled = crate::pipeline::skyfill::filled_path(Path::new(input));
                fs::copy(input, filled).expect("fake fill");
            }
            "exiftool" => {}
            _ => touch_output_of(spec),
        }
        ok()
    }

    struct Fixture {
        root: PathBuf,
        config: PipelineConfig,
    }

    fn fixture(tag: &str, image_count: usize) -> Fixture {
        let root = temp_dir(tag);
        let input = root.join("site-a");
        fs::create_dir_all(input.as_path()).expect("input dir");
        for i in 0..image_count {
            fs::write(input.join(format!("DJI_{i:04}.JPG")), b"jpg").expect("image");
        }
        let bin = root.join("bin");
        install_fake_tools(
            bin.as_path(),
            ToolKind::MANDATORY.into_iter().chain(ToolKind::FETCHABLE),
        );
        let overlay = PanoSettingsOverlay {
            expected_image_count: Some(u32::try_from(image_count).unwrap_or(0)),
            ..PanoSettingsOverlay::default()
        };
        let mut config =
            PipelineConfig::from_overlay(root.as_path(), input, false, &overlay).expect("config");
        config.tooling.search = ToolSearch::isolated(Platform { os: Os::Linux }, vec![bin]);
        Fixture { root, config }
    }

    fn pipeline(
        config: PipelineConfig,
        runner: FakeRunner,
    ) -> (PanoramaPipeline<FakeRunner, NoDownloads>, Arc<Mutex<u32>>) {
        let calls = Arc::new(Mutex::new(0));
        let downloader = NoDownloads {
            calls: Arc::clone(&calls),
        };
        (PanoramaPipeline::new(config, runner, downloader), calls)
    }

    #[test]
    fn states_are_linear() {
        let names: Vec<_> = PipelineState::ORDER.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "validating-input",
                "locating-tools",
                "fetching-deps",
                "stitching",
                "resizing",
                "sky-filling",
                "injecting-metadata",
                "done"
            ]
        );
    }

    #[test]
    fn full_run_publishes_panorama_and_summary() {
        let fx = fixture("driver_full", 3);
        let runner = FakeRunner::new(simulate);
        let (pipeline, downloads) = pipeline(fx.config.clone(), runner.clone());

        let outcome = pipeline.run().expect("run should succeed");

        assert_eq!(outcome.output, fx.root.join("output/site-a_pano.jpg"));
        assert!(outcome.output.is_file());
        assert!(outcome.summary_path.is_file());
        assert_eq!((outcome.summary.width, outcome.summary.height), (64, 32));
        assert_eq!(outcome.summary.stages.len(), 10);
        assert_eq!(
            runner.programs(),
            vec![
                "pto_gen",
                "cpfind",
                "cpclean",
                "autooptimiser",
                "pano_modify",
                "nona",
                "enblend",
                "magick",
                "skyfill",
                "exiftool"
            ]
        );
        assert_eq!(*downloads.lock().expect("calls"), 0);
        assert!(!fx.config.work_dir.exists(), "work dir removed on success");
    }

    #[test]
    fn debug_skip_reuses_intermediates_without_launching_tools() {
        let fx = fixture("driver_skip", 2);
        let mut config = fx.config.clone();
        config.keep_work_dir = true;
        let (first, _) = pipeline(config.clone(), FakeRunner::new(simulate));
        let full = first.run().expect("first run");
        let full_bytes = fs::read(full.output.as_path()).expect("published panorama");

        config.debug_skip = true;
        let runner = FakeRunner::new(simulate);
        let (second, _) = pipeline(config, runner.clone());
        let outcome = second.run().expect("skip run");

        assert!(runner.seen().is_empty());
        assert!(outcome
            .summary
            .stages
            .iter()
            .all(|s| s.outcome == StageOutcome::Skipped));
        assert_eq!(outcome.output, full.output);
        assert!(
            fs::read(outcome.output.as_path()).expect("republished panorama") == full_bytes,
            "debug-skip rerun must publish the same bytes"
        );
    }

    #[test]
    fn fresh_run_does_not_blend_leftover_tiles() {
        let fx = fixture("driver_stale_tiles", 2);
        fs::create_dir_all(fx.config.work_dir.as_path()).expect("work dir");
        fs::write(fx.config.work_dir.join("remap0005.tif"), b"other set").expect("stale tile");
        let runner = FakeRunner::new(simulate);
        let (pipeline, _) = pipeline(fx.config.clone(), runner.clone());

        pipeline.run().expect("run should succeed");

        let blend = runner
            .seen()
            .into_iter()
            .find(|spec| program_name(spec) == "enblend")
            .expect("blend ran");
        let tiles: Vec<_> = blend.args[2..]
            .iter()
            .map(|arg| Path::new(arg).file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(
            tiles,
            vec![
                Some(String::from("remap0000.tif")),
                Some(String::from("remap0001.tif")),
            ]
        );
    }

    #[test]
    fn leftover_stage_output_is_never_published() {
        let fx = fixture("driver_stale_fill", 2);
        fs::create_dir_all(fx.config.work_dir.as_path()).expect("work dir");
        fs::write(fx.config.work_dir.join("resized-filled.jpg"), b"old").expect("stale fill");
        let runner = FakeRunner::new(|spec| {
            if program_name(spec) == "skyfill" {
                ok()
            } else {
                simulate(spec)
            }
        });
        let (pipeline, _) = pipeline(fx.config.clone(), runner);

        let err = pipeline.run().expect_err("sky fill wrote nothing");
        assert_eq!(err.state, PipelineState::SkyFilling);
        assert!(matches!(
            err.source,
            PipelineError::Stage(StageError::MissingOutput { .. })
        ));
        assert!(!fx.root.join("output/site-a_pano.jpg").exists());
    }

    #[test]
    fn work_dir_containing_the_input_is_not_cleared() {
        let fx = fixture("driver_overlap", 2);
        let mut config = fx.config.clone();
        config.work_dir = fx.root.clone();
        let runner = FakeRunner::new(simulate);
        let (pipeline, _) = pipeline(config.clone(), runner.clone());

        let err = pipeline.run().expect_err("overlapping work dir");
        assert_eq!(err.state, PipelineState::Stitching);
        assert!(matches!(err.source, PipelineError::WorkDirOverlap { .. }));
        assert!(config.input_dir.join("DJI_0000.JPG").is_file());
        assert!(runner.seen().is_empty());
    }

    #[test]
    fn empty_folder_fails_before_any_tool() {
        let fx = fixture("driver_empty", 0);
        let runner = FakeRunner::new(simulate);
        let (pipeline, _) = pipeline(fx.config.clone(), runner.clone());

        let err = pipeline.run().expect_err("no images");
        assert_eq!(err.state, PipelineState::ValidatingInput);
        assert!(err.to_string().starts_with("validating-input failed"));
        assert!(runner.seen().is_empty());
    }

    #[test]
    fn missing_mandatory_tool_fails_before_any_process() {
        let fx = fixture("driver_missing", 2);
        fs::remove_file(fx.root.join("bin/enblend")).expect("remove enblend");
        let runner = FakeRunner::new(simulate);
        let (pipeline, _) = pipeline(fx.config.clone(), runner.clone());

        let err = pipeline.run().expect_err("enblend missing");
        assert_eq!(err.state, PipelineState::LocatingTools);
        assert!(err.to_string().contains("enblend"));
        assert!(runner.seen().is_empty());
    }

    #[test]
    fn stage_failure_is_tagged_with_its_state() {
        let fx = fixture("driver_stage_fail", 2);
        let runner = FakeRunner::new(|spec| {
            if program_name(spec) == "magick" {
                failed(1, "magick: no decode delegate")
            } else {
                simulate(spec)
            }
        });
        let (pipeline, _) = pipeline(fx.config.clone(), runner);

        let err = pipeline.run().expect_err("resize fails");
        assert_eq!(err.state, PipelineState::Resizing);
        assert!(fx.config.work_dir.exists(), "work dir kept after failure");
    }

    #[test]
    fn check_tools_reports_hints_for_missing_tools() {
        let fx = fixture("driver_check", 1);
        fs::remove_file(fx.root.join("bin/exiftool")).expect("remove exiftool");
        let (pipeline, downloads) = pipeline(fx.config.clone(), FakeRunner::new(simulate));

        let report = pipeline.check_tools();
        assert_eq!(report.len(), 10);
        let exiftool = report
            .iter()
            .find(|s| s.tool == ToolKind::ExifTool)
            .expect("exiftool row");
        assert!(!exiftool.found);
        assert!(!exiftool.fetchable);
        assert!(exiftool
            .hint
            .as_deref()
            .is_some_and(|h| h.contains("libimage-exiftool-perl")));
        assert_eq!(*downloads.lock().expect("calls"), 0);
    }
}
