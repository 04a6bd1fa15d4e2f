use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_SETTINGS_TOML: &str = "config/pano.settings.toml";
pub const DEFAULT_SETTINGS_JSON: &str = "config/pano.settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PanoSettingsOverlay {
    pub work_dir: Option<String>,
    pub output_dir: Option<String>,
    pub tools_dir: Option<String>,
    pub extra_tool_dirs: Option<Vec<String>>,
    pub expected_image_count: Option<u32>,
    pub strict_image_count: Option<bool>,
    pub keep_work_dir: Option<bool>,
    pub verify_payload: Option<bool>,
    pub fetch_attempts: Option<u32>,
    pub fetch_backoff_ms: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub skyfill_policy: Option<String>,
    pub skyfill_quality: Option<u8>,
    pub resize_quality: Option<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineSettingsLayerError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("settings root must be an object")]
    RootMustBeObject,
    #[error("settings field '{field}' has invalid type or value")]
    InvalidFieldType { field: String },
}

/// Loads the settings file: an explicit path (which must exist), else the
/// default TOML file, else the default JSON file, else an empty overlay.
pub fn load_pano_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<PanoSettingsOverlay, PipelineSettingsLayerError> {
    if let Some(path) = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
    {
        if !path.is_file() {
            return Err(PipelineSettingsLayerError::ReadFile {
                path: path.display().to_string(),
                message: String::from("file not found"),
            });
        }
        return load_optional_overlay_by_extension(path.as_path());
    }

    let toml_path = app_root.join(DEFAULT_SETTINGS_TOML);
    if toml_path.exists() {
        return load_optional_overlay_from_toml_path(toml_path.as_path());
    }

    load_optional_overlay_from_json_path(app_root.join(DEFAULT_SETTINGS_JSON).as_path())
}

pub fn merge_pano_settings_overlays(
    file: &PanoSettingsOverlay,
    overrides: &PanoSettingsOverlay,
) -> PanoSettingsOverlay {
    PanoSettingsOverlay {
        work_dir: choose_string(overrides.work_dir.as_deref(), file.work_dir.as_deref()),
        output_dir: choose_string(overrides.output_dir.as_deref(), file.output_dir.as_deref()),
        tools_dir: choose_string(overrides.tools_dir.as_deref(), file.tools_dir.as_deref()),
        extra_tool_dirs: overrides
            .extra_tool_dirs
            .clone()
            .or_else(|| file.extra_tool_dirs.clone()),
        expected_image_count: overrides
            .expected_image_count
            .or(file.expected_image_count),
        strict_image_count: overrides.strict_image_count.or(file.strict_image_count),
        keep_work_dir: overrides.keep_work_dir.or(file.keep_work_dir),
        verify_payload: overrides.verify_payload.or(file.verify_payload),
        fetch_attempts: overrides.fetch_attempts.or(file.fetch_attempts),
        fetch_backoff_ms: overrides.fetch_backoff_ms.or(file.fetch_backoff_ms),
        fetch_timeout_secs: overrides.fetch_timeout_secs.or(file.fetch_timeout_secs),
        skyfill_policy: choose_string(
            overrides.skyfill_policy.as_deref(),
            file.skyfill_policy.as_deref(),
        ),
        skyfill_quality: overrides.skyfill_quality.or(file.skyfill_quality),
        resize_quality: overrides.resize_quality.or(file.resize_quality),
    }
}

pub fn parse_pano_settings_overlay_json(
    value: &Value,
) -> Result<PanoSettingsOverlay, PipelineSettingsLayerError> {
    let root = value
        .as_object()
        .ok_or(PipelineSettingsLayerError::RootMustBeObject)?;
    let pano_value = root.get("pano").unwrap_or(value);
    let pano = pano_value
        .as_object()
        .ok_or(PipelineSettingsLayerError::RootMustBeObject)?;

    let mut out = PanoSettingsOverlay::default();
    if let Some(v) = pano.get("work_dir") {
        out.work_dir = Some(parse_string(v, "work_dir")?);
    }
    if let Some(v) = pano.get("output_dir") {
        out.output_dir = Some(parse_string(v, "output_dir")?);
    }
    if let Some(v) = pano.get("tools_dir") {
        out.tools_dir = Some(parse_string(v, "tools_dir")?);
    }
    if let Some(v) = pano.get("extra_tool_dirs") {
        out.extra_tool_dirs = Some(parse_string_array(v, "extra_tool_dirs")?);
    }
    if let Some(v) = pano.get("expected_image_count") {
        out.expected_image_count = Some(parse_u32(v, "expected_image_count")?);
    }
    if let Some(v) = pano.get("strict_image_count") {
        out.strict_image_count = Some(parse_bool(v, "strict_image_count")?);
    }
    if let Some(v) = pano.get("keep_work_dir") {
        out.keep_work_dir = Some(parse_bool(v, "keep_work_dir")?);
    }
    if let Some(v) = pano.get("verify_payload") {
        out.verify_payload = Some(parse_bool(v, "verify_payload")?);
    }
    if let Some(fetch) = pano.get("fetch") {
        let fetch =
            fetch
                .as_object()
                .ok_or_else(|| PipelineSettingsLayerError::InvalidFieldType {
                    field: String::from("fetch"),
                })?;
        if let Some(v) = fetch.get("attempts") {
            let attempts = parse_u32(v, "fetch.attempts")?;
            if attempts == 0 {
                return Err(PipelineSettingsLayerError::InvalidFieldType {
                    field: String::from("fetch.attempts"),
                });
            }
            out.fetch_attempts = Some(attempts);
        }
        if let Some(v) = fetch.get("backoff_ms") {
            out.fetch_backoff_ms = Some(parse_u64(v, "fetch.backoff_ms")?);
        }
        if let Some(v) = fetch.get("timeout_secs") {
            out.fetch_timeout_secs = Some(parse_u64(v, "fetch.timeout_secs")?);
        }
    }
    if let Some(skyfill) = pano.get("skyfill") {
        let skyfill =
            skyfill
                .as_object()
                .ok_or_else(|| PipelineSettingsLayerError::InvalidFieldType {
                    field: String::from("skyfill"),
                })?;
        if let Some(v) = skyfill.get("policy") {
            out.skyfill_policy = Some(parse_skyfill_policy_string(v, "skyfill.policy")?);
        }
        if let Some(v) = skyfill.get("quality") {
            out.skyfill_quality = Some(parse_quality(v, "skyfill.quality")?);
        }
    }
    if let Some(resize) = pano.get("resize") {
        let resize =
            resize
                .as_object()
                .ok_or_else(|| PipelineSettingsLayerError::InvalidFieldType {
                    field: String::from("resize"),
                })?;
        if let Some(v) = resize.get("quality") {
            out.resize_quality = Some(parse_quality(v, "resize.quality")?);
        }
    }
    Ok(out)
}

fn load_optional_overlay_by_extension(
    path: &Path,
) -> Result<PanoSettingsOverlay, PipelineSettingsLayerError> {
    match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "toml" => load_optional_overlay_from_toml_path(path),
        _ => load_optional_overlay_from_json_path(path),
    }
}

fn load_optional_overlay_from_json_path(
    path: &Path,
) -> Result<PanoSettingsOverlay, PipelineSettingsLayerError> {
    if !path.exists() {
        return Ok(PanoSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| PipelineSettingsLayerError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed = serde_json::from_str::<Value>(raw.as_str()).map_err(|error| {
        PipelineSettingsLayerError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    })?;
    parse_pano_settings_overlay_json(&parsed)
}

fn load_optional_overlay_from_toml_path(
    path: &Path,
) -> Result<PanoSettingsOverlay, PipelineSettingsLayerError> {
    if !path.exists() {
        return Ok(PanoSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| PipelineSettingsLayerError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
        PipelineSettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    })?;
    let json_value =
        serde_json::to_value(parsed).map_err(|error| PipelineSettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_pano_settings_overlay_json(&json_value)
}

fn choose_string(a: Option<&str>, b: Option<&str>) -> Option<String> {
    a.or(b).map(str::to_string)
}

fn invalid(field: &str) -> PipelineSettingsLayerError {
    PipelineSettingsLayerError::InvalidFieldType {
        field: field.to_string(),
    }
}

fn parse_string(value: &Value, field: &str) -> Result<String, PipelineSettingsLayerError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| invalid(field))?;
    if parsed.is_empty() {
        return Err(invalid(field));
    }
    Ok(parsed.to_string())
}

fn parse_bool(value: &Value, field: &str) -> Result<bool, PipelineSettingsLayerError> {
    value.as_bool().ok_or_else(|| invalid(field))
}

fn parse_u64(value: &Value, field: &str) -> Result<u64, PipelineSettingsLayerError> {
    value.as_u64().ok_or_else(|| invalid(field))
}

fn parse_u32(value: &Value, field: &str) -> Result<u32, PipelineSettingsLayerError> {
    u32::try_from(parse_u64(value, field)?).map_err(|_| invalid(field))
}

fn parse_quality(value: &Value, field: &str) -> Result<u8, PipelineSettingsLayerError> {
    u8::try_from(parse_u64(value, field)?)
        .ok()
        .filter(|q| (1..=100).contains(q))
        .ok_or_else(|| invalid(field))
}

fn parse_string_array(
    value: &Value,
    field: &str,
) -> Result<Vec<String>, PipelineSettingsLayerError> {
    let arr = value.as_array().ok_or_else(|| invalid(field))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(parse_string(item, field)?);
    }
    Ok(out)
}

fn parse_skyfill_policy_string(
    value: &Value,
    field: &str,
) -> Result<String, PipelineSettingsLayerError> {
    let parsed = parse_string(value, field)?.to_ascii_lowercase();
    if matches!(parsed.as_str(), "required" | "best_effort") {
        Ok(parsed)
    } else {
        Err(invalid(field))
    }
}
