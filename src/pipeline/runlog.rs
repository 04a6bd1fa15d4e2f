use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::stages::{StageOutcome, StageReport};
use crate::pipeline::tools::ResolvedTools;

/// Written next to the panorama after a successful run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub input_dir: String,
    pub folder_name: String,
    pub image_count: usize,
    pub output: String,
    pub width: u32,
    pub height: u32,
    pub platform: String,
    pub debug_skip: bool,
    pub skyfill_policy: String,
    pub started_at: String,
    pub finished_at: String,
    pub tools: ResolvedTools,
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    pub fn degraded_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.outcome == StageOutcome::Degraded)
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("failed to create run-log parent directory '{path}': {message}")]
    CreateParent { path: String, message: String },
    #[error("failed to serialize run log JSON: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write run log '{path}': {message}")]
    WriteFile { path: String, message: String },
}

pub fn write_pretty_json_with_newline<T>(path: &Path, value: &T) -> Result<(), RunLogError>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| RunLogError::CreateParent {
            path: parent.display().to_string(),
            message: error.to_string(),
        })?;
    }

    let mut bytes = serde_json::to_vec_pretty(value).map_err(RunLogError::Serialize)?;
    bytes.push(b'\n');
    fs::write(path, bytes).map_err(|error| RunLogError::WriteFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    Ok(())
}

pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file_path() -> std::path::PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("pano_runlog_{stamp}"))
            .join("nested")
            .join("site_pano.run.json")
    }

    fn summary() -> RunSummary {
        RunSummary {
            input_dir: String::from("/in/site"),
            folder_name: String::from("site"),
            image_count: 26,
            output: String::from("/out/site_pano.jpg"),
            width: 8000,
            height: 4000,
            platform: String::from("linux"),
            debug_skip: false,
            skyfill_policy: String::from("best_effort"),
            started_at: timestamp_now(),
            finished_at: timestamp_now(),
            tools: ResolvedTools::default(),
            stages: vec![
                StageReport {
                    name: String::from("resize"),
                    outcome: StageOutcome::Executed,
                    command: Some(String::from("magick a b")),
                    output: String::from("/w/resized.jpg"),
                    duration_ms: 12,
                },
                StageReport {
                    name: String::from("sky-fill"),
                    outcome: StageOutcome::Degraded,
                    command: None,
                    output: String::from("/w/resized-filled.jpg"),
                    duration_ms: 0,
                },
            ],
        }
    }

    #[test]
    fn writes_pretty_json_with_trailing_newline() {
        let path = temp_file_path();
        write_pretty_json_with_newline(path.as_path(), &summary()).expect("run log should write");

        let raw = fs::read_to_string(path.as_path()).expect("run log should be readable");
        assert!(raw.ends_with('\n'));
        assert!(raw.contains("\n  \"folder_name\": \"site\""));

        let parsed: Value = serde_json::from_str(raw.as_str()).expect("valid json");
        assert_eq!(parsed["stages"][1]["outcome"], "degraded");
        assert!(parsed["stages"][1].get("command").is_none());
    }

    #[test]
    fn degraded_stages_are_listed() {
        assert_eq!(summary().degraded_stages(), vec!["sky-fill"]);
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let stamp = timestamp_now();
        assert!(stamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(stamp.as_str()).is_ok());
    }
}
