use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::settings_layer::{PanoSettingsOverlay, PipelineSettingsLayerError};

pub const DEFAULT_WORK_DIR: &str = "temp";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_TOOLS_DIR: &str = "tools";
/// Image count of the DJI sphere capture pattern.
pub const DEFAULT_EXPECTED_IMAGE_COUNT: u32 = 26;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Windows,
    MacOs,
    Linux,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
}

impl Platform {
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => Os::Windows,
            "macos" => Os::MacOs,
            "linux" => Os::Linux,
            _ => Os::Other,
        };
        Self { os }
    }

    pub fn as_str(self) -> &'static str {
        match self.os {
            Os::Windows => "windows",
            Os::MacOs => "macos",
            Os::Linux => "linux",
            Os::Other => "other",
        }
    }

    pub fn executable_name(self, base: &str) -> String {
        match self.os {
            Os::Windows => format!("{base}.exe"),
            _ => base.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkyFillPolicy {
    /// Sky-fill failure aborts the run.
    #[default]
    Required,
    /// Sky-fill failure is logged and the resized image is used unfilled.
    BestEffort,
}

impl SkyFillPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "required" => Some(Self::Required),
            "best_effort" => Some(Self::BestEffort),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::BestEffort => "best_effort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSearch {
    pub platform: Platform,
    /// Directories of the command search path, in order.
    pub search_path: Vec<PathBuf>,
    pub use_known_dirs: bool,
    pub extra_dirs: Vec<PathBuf>,
}

impl ToolSearch {
    pub fn from_env(platform: Platform) -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|raw| std::env::split_paths(&raw).collect::<Vec<_>>())
            .unwrap_or_default();
        Self {
            platform,
            search_path,
            use_known_dirs: true,
            extra_dirs: Vec::new(),
        }
    }

    /// Search restricted to the given directories.
    pub fn isolated(platform: Platform, dirs: Vec<PathBuf>) -> Self {
        Self {
            platform,
            search_path: dirs,
            use_known_dirs: false,
            extra_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(1000),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolingConfig {
    pub tools_dir: PathBuf,
    pub search: ToolSearch,
    pub fetch: FetchSettings,
}

impl ToolingConfig {
    pub fn from_overlay(app_root: &Path, overlay: &PanoSettingsOverlay) -> Self {
        let mut search = ToolSearch::from_env(Platform::current());
        search.extra_dirs = overlay
            .extra_tool_dirs
            .iter()
            .flatten()
            .map(|dir| resolve_dir(app_root, dir))
            .collect();
        let defaults = FetchSettings::default();
        Self {
            tools_dir: resolve_dir(
                app_root,
                overlay.tools_dir.as_deref().unwrap_or(DEFAULT_TOOLS_DIR),
            ),
            search,
            fetch: FetchSettings {
                attempts: overlay.fetch_attempts.unwrap_or(defaults.attempts),
                backoff: overlay
                    .fetch_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff),
                timeout: overlay
                    .fetch_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
            },
        }
    }
}

/// Everything a run needs, built once at startup and passed by reference to
/// every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub tooling: ToolingConfig,
    pub debug_skip: bool,
    pub expected_image_count: u32,
    pub strict_image_count: bool,
    pub keep_work_dir: bool,
    pub verify_payload: bool,
    pub skyfill_policy: SkyFillPolicy,
    pub skyfill_quality: u8,
    pub resize_quality: u8,
}

impl PipelineConfig {
    pub fn from_overlay(
        app_root: &Path,
        input_dir: PathBuf,
        debug_skip: bool,
        overlay: &PanoSettingsOverlay,
    ) -> Result<Self, PipelineSettingsLayerError> {
        let skyfill_policy = match overlay.skyfill_policy.as_deref() {
            Some(raw) => SkyFillPolicy::parse(raw).ok_or_else(|| {
                PipelineSettingsLayerError::InvalidFieldType {
                    field: String::from("skyfill.policy"),
                }
            })?,
            None => SkyFillPolicy::default(),
        };
        let input_dir = if input_dir.is_absolute() {
            input_dir
        } else {
            app_root.join(input_dir)
        };
        Ok(Self {
            input_dir,
            work_dir: resolve_dir(
                app_root,
                overlay.work_dir.as_deref().unwrap_or(DEFAULT_WORK_DIR),
            ),
            output_dir: resolve_dir(
                app_root,
                overlay.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR),
            ),
            tooling: ToolingConfig::from_overlay(app_root, overlay),
            debug_skip,
            expected_image_count: overlay
                .expected_image_count
                .unwrap_or(DEFAULT_EXPECTED_IMAGE_COUNT),
            strict_image_count: overlay.strict_image_count.unwrap_or(false),
            keep_work_dir: overlay.keep_work_dir.unwrap_or(false),
            verify_payload: overlay.verify_payload.unwrap_or(true),
            skyfill_policy,
            skyfill_quality: overlay.skyfill_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            resize_quality: overlay.resize_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        })
    }
}

fn resolve_dir(app_root: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        app_root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_script_layout() {
        let root = PathBuf::from("/work");
        let config = PipelineConfig::from_overlay(
            root.as_path(),
            PathBuf::from("dji-images"),
            false,
            &PanoSettingsOverlay::default(),
        )
        .expect("default config should build");

        assert_eq!(config.input_dir, PathBuf::from("/work/dji-images"));
        assert_eq!(config.work_dir, PathBuf::from("/work/temp"));
        assert_eq!(config.output_dir, PathBuf::from("/work/output"));
        assert_eq!(config.tooling.tools_dir, PathBuf::from("/work/tools"));
        assert_eq!(config.expected_image_count, 26);
        assert_eq!(config.skyfill_policy, SkyFillPolicy::Required);
        assert!(config.verify_payload);
        assert!(!config.keep_work_dir);
        assert_eq!(config.tooling.fetch, FetchSettings::default());
    }

    #[test]
    fn overlay_values_are_applied() {
        let overlay = PanoSettingsOverlay {
            work_dir: Some(String::from("/scratch")),
            extra_tool_dirs: Some(vec![String::from("hugin/bin")]),
            skyfill_policy: Some(String::from("best_effort")),
            fetch_attempts: Some(5),
            fetch_backoff_ms: Some(10),
            ..PanoSettingsOverlay::default()
        };
        let config = PipelineConfig::from_overlay(
            Path::new("/work"),
            PathBuf::from("/data/flight-1"),
            true,
            &overlay,
        )
        .expect("config should build");

        assert_eq!(config.input_dir, PathBuf::from("/data/flight-1"));
        assert_eq!(config.work_dir, PathBuf::from("/scratch"));
        assert_eq!(
            config.tooling.search.extra_dirs,
            vec![PathBuf::from("/work/hugin/bin")]
        );
        assert_eq!(config.skyfill_policy, SkyFillPolicy::BestEffort);
        assert_eq!(config.tooling.fetch.attempts, 5);
        assert_eq!(config.tooling.fetch.backoff, Duration::from_millis(10));
        assert!(config.debug_skip);
    }

    #[test]
    fn executable_name_adds_exe_only_on_windows() {
        let windows = Platform { os: Os::Windows };
        let linux = Platform { os: Os::Linux };
        assert_eq!(windows.executable_name("nona"), "nona.exe");
        assert_eq!(linux.executable_name("nona"), "nona");
    }
}
