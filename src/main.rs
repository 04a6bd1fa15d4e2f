use std::path::{Path, PathBuf};
use std::process::ExitCode;

use dji_pano_stitcher::pipeline::config::PipelineConfig;
use dji_pano_stitcher::pipeline::driver::{
    PanoramaPipeline, PipelineError, PipelineState, RunError,
};
use dji_pano_stitcher::pipeline::fetch::HttpArchiveDownloader;
use dji_pano_stitcher::pipeline::runtime::StdPipelineCommandRunner;
use dji_pano_stitcher::pipeline::settings_layer::{
    load_pano_settings, merge_pano_settings_overlays, PanoSettingsOverlay,
    PipelineSettingsLayerError,
};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}\n\nUse --help for usage.")]
    Usage(String),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("{0}")]
    Other(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Usage(_) => ExitCode::from(2),
            Self::Run(_) | Self::Other(_) => ExitCode::from(1),
        }
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let result = if matches!(cli_args.first().map(String::as_str), Some("check-tools")) {
        run_check_tools_cli(&cli_args[1..])
    } else {
        run_stitch_cli(&cli_args)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let CliError::Run(run) = &err {
                error!(state = run.state.as_str(), "pipeline aborted");
            }
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StitchCliArgs {
    images: PathBuf,
    debug_skip: bool,
    config_path: Option<String>,
    overrides: PanoSettingsOverlay,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CheckToolsCliArgs {
    config_path: Option<String>,
    overrides: PanoSettingsOverlay,
}

fn wants_help(args: &[String]) -> bool {
    args.iter().any(|arg| matches!(arg.as_str(), "-h" | "--help"))
}

fn parse_stitch_cli_args(args: &[String]) -> Result<StitchCliArgs, CliError> {
    let mut parsed = StitchCliArgs::default();
    let mut images = None::<PathBuf>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, CliError> {
            let Some(value) = args.get(idx + 1) else {
                return Err(CliError::Usage(format!("Missing value for {flag}")));
            };
            Ok(value.clone())
        };

        match flag {
            "--debug-skip" => {
                parsed.debug_skip = true;
                i += 1;
            }
            "--best-effort-skyfill" => {
                parsed.overrides.skyfill_policy = Some(String::from("best_effort"));
                i += 1;
            }
            "--config" => {
                parsed.config_path = Some(needs_value(i)?);
                i += 2;
            }
            "--work-dir" => {
                parsed.overrides.work_dir = Some(needs_value(i)?);
                i += 2;
            }
            "--output-dir" => {
                parsed.overrides.output_dir = Some(needs_value(i)?);
                i += 2;
            }
            "--tools-dir" => {
                parsed.overrides.tools_dir = Some(needs_value(i)?);
                i += 2;
            }
            unknown if unknown.starts_with("--") => {
                return Err(CliError::Usage(format!("Unknown argument: {unknown}")));
            }
            positional => {
                if images.is_some() {
                    return Err(CliError::Usage(format!(
                        "Unexpected extra argument: {positional}"
                    )));
                }
                images = Some(PathBuf::from(positional));
                i += 1;
            }
        }
    }

    parsed.images =
        images.ok_or_else(|| CliError::Usage(String::from("Missing image folder argument")))?;
    Ok(parsed)
}

fn parse_check_tools_cli_args(args: &[String]) -> Result<CheckToolsCliArgs, CliError> {
    let mut parsed = CheckToolsCliArgs::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, CliError> {
            let Some(value) = args.get(idx + 1) else {
                return Err(CliError::Usage(format!("Missing value for {flag}")));
            };
            Ok(value.clone())
        };

        match flag {
            "--config" => {
                parsed.config_path = Some(needs_value(i)?);
                i += 2;
            }
            "--tools-dir" => {
                parsed.overrides.tools_dir = Some(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(CliError::Usage(format!("Unknown argument: {unknown}")));
            }
        }
    }
    Ok(parsed)
}

fn build_config(
    app_root: &Path,
    images: PathBuf,
    debug_skip: bool,
    config_path: Option<&str>,
    overrides: &PanoSettingsOverlay,
) -> Result<PipelineConfig, RunError> {
    let settings_error = |err: PipelineSettingsLayerError| {
        RunError::new(PipelineState::ValidatingInput, PipelineError::Settings(err))
    };
    let file = load_pano_settings(app_root, config_path).map_err(settings_error)?;
    let merged = merge_pano_settings_overlays(&file, overrides);
    PipelineConfig::from_overlay(app_root, images, debug_skip, &merged).map_err(settings_error)
}

fn build_pipeline(
    config: PipelineConfig,
) -> Result<PanoramaPipeline<StdPipelineCommandRunner, HttpArchiveDownloader>, RunError> {
    let downloader = HttpArchiveDownloader::new(&config.tooling.fetch).map_err(|message| {
        RunError::new(PipelineState::FetchingDeps, PipelineError::Downloader(message))
    })?;
    Ok(PanoramaPipeline::new(config, StdPipelineCommandRunner, downloader))
}

fn current_dir() -> Result<PathBuf, CliError> {
    std::env::current_dir()
        .map_err(|e| CliError::Other(format!("cannot read current directory: {e}")))
}

fn run_stitch_cli(args: &[String]) -> Result<(), CliError> {
    if args.is_empty() || wants_help(args) {
        print_usage();
        return if args.is_empty() {
            Err(CliError::Usage(String::from("Missing image folder argument")))
        } else {
            Ok(())
        };
    }
    let parsed = parse_stitch_cli_args(args)?;
    let app_root = current_dir()?;
    let config = build_config(
        app_root.as_path(),
        parsed.images,
        parsed.debug_skip,
        parsed.config_path.as_deref(),
        &parsed.overrides,
    )?;
    let pipeline = build_pipeline(config)?;
    let outcome = pipeline.run()?;

    for stage in outcome.summary.degraded_stages() {
        warn!(stage, "finished without this stage");
    }
    println!("Done → {}", outcome.output.display());
    Ok(())
}

fn run_check_tools_cli(args: &[String]) -> Result<(), CliError> {
    if wants_help(args) {
        print_usage();
        return Ok(());
    }
    let parsed = parse_check_tools_cli_args(args)?;
    let app_root = current_dir()?;
    let config = build_config(
        app_root.as_path(),
        app_root.clone(),
        false,
        parsed.config_path.as_deref(),
        &parsed.overrides,
    )?;
    let pipeline = build_pipeline(config)?;
    let report = pipeline.check_tools();
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| CliError::Other(format!("failed to render tool report: {e}")))?;
    println!("{json}");

    let missing_mandatory = report.iter().any(|s| s.mandatory && !s.found);
    if missing_mandatory {
        return Err(CliError::Other(String::from("mandatory tools are missing")));
    }
    Ok(())
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  dji-pano-stitcher <images> [--debug-skip] [--config PATH] [--work-dir DIR]\n",
        "                    [--output-dir DIR] [--tools-dir DIR] [--best-effort-skyfill]\n",
        "  dji-pano-stitcher check-tools [--config PATH] [--tools-dir DIR]\n\n",
        "Settings default: config/pano.settings.toml (fallback: config/pano.settings.json)\n",
        "Log level: RUST_LOG (default info)\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_stitch_requires_image_folder() {
        let err = parse_stitch_cli_args(&args(&["--debug-skip"])).expect_err("folder required");
        assert!(err.to_string().contains("Missing image folder"));
        assert!(matches!(err, CliError::Usage(_)));
    }

    #[test]
    fn parse_stitch_accepts_all_flags() {
        let parsed = parse_stitch_cli_args(&args(&[
            "dji-images",
            "--debug-skip",
            "--config",
            "my.toml",
            "--work-dir",
            "scratch",
            "--output-dir",
            "out",
            "--tools-dir",
            "bin",
            "--best-effort-skyfill",
        ]))
        .expect("parse should succeed");

        assert_eq!(parsed.images, PathBuf::from("dji-images"));
        assert!(parsed.debug_skip);
        assert_eq!(parsed.config_path.as_deref(), Some("my.toml"));
        assert_eq!(parsed.overrides.work_dir.as_deref(), Some("scratch"));
        assert_eq!(parsed.overrides.output_dir.as_deref(), Some("out"));
        assert_eq!(parsed.overrides.tools_dir.as_deref(), Some("bin"));
        assert_eq!(parsed.overrides.skyfill_policy.as_deref(), Some("best_effort"));
    }

    #[test]
    fn parse_stitch_rejects_unknown_and_extra_arguments() {
        let err = parse_stitch_cli_args(&args(&["a", "--fast"])).expect_err("unknown flag");
        assert!(err.to_string().contains("Unknown argument: --fast"));
        let err = parse_stitch_cli_args(&args(&["a", "b"])).expect_err("two folders");
        assert!(err.to_string().contains("Unexpected extra argument: b"));
    }

    #[test]
    fn parse_stitch_reports_missing_flag_value() {
        let err = parse_stitch_cli_args(&args(&["a", "--work-dir"])).expect_err("value required");
        assert!(err.to_string().contains("Missing value for --work-dir"));
    }

    #[test]
    fn parse_check_tools_accepts_tools_dir() {
        let parsed = parse_check_tools_cli_args(&args(&["--tools-dir", "vendor-bin"]))
            .expect("parse should succeed");
        assert_eq!(parsed.overrides.tools_dir.as_deref(), Some("vendor-bin"));
        assert!(parse_check_tools_cli_args(&args(&["--debug-skip"])).is_err());
    }
}
