use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "tif", "tiff", "dng"];

#[derive(Debug, Error)]
pub enum InputError {
    #[error("image folder does not exist: {0}")]
    MissingFolder(PathBuf),
    #[error("image folder path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("image folder contains no images: {0}")]
    Empty(PathBuf),
    #[error("expected {expected} images but found {found}")]
    CountMismatch { expected: u32, found: usize },
    #[error("cannot derive an output name from {0}")]
    UnnamedFolder(PathBuf),
    #[error("failed to read image folder {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source images of one run, sorted by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub folder_name: String,
    pub images: Vec<PathBuf>,
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|v| v.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

pub fn list_input_images(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_path(path.as_path()) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Checks the input folder and collects its images. A count different from
/// `expected` is only a warning unless `strict` is set.
pub fn load_image_set(dir: &Path, expected: u32, strict: bool) -> Result<ImageSet, InputError> {
    if !dir.exists() {
        return Err(InputError::MissingFolder(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(InputError::NotADirectory(dir.to_path_buf()));
    }
    let folder_name = input_folder_name(dir)?;
    let images = list_input_images(dir).map_err(|source| InputError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    if images.is_empty() {
        return Err(InputError::Empty(dir.to_path_buf()));
    }
    if images.len() != expected as usize {
        if strict {
            return Err(InputError::CountMismatch {
                expected,
                found: images.len(),
            });
        }
        warn!(
            expected,
            found = images.len(),
            "image count differs from the supported capture pattern"
        );
    }
    Ok(ImageSet {
        folder_name,
        images,
    })
}

fn input_folder_name(dir: &Path) -> Result<String, InputError> {
    let named = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty() && name != "." && name != "..");
    if let Some(name) = named {
        return Ok(name);
    }
    fs::canonicalize(dir)
        .ok()
        .and_then(|abs| abs.file_name().map(|n| n.to_string_lossy().to_string()))
        .ok_or_else(|| InputError::UnnamedFolder(dir.to_path_buf()))
}

pub fn output_file_name(folder_name: &str) -> String {
    format!("{folder_name}_pano.jpg")
}

pub fn run_summary_file_name(folder_name: &str) -> String {
    format!("{folder_name}_pano.run.json")
}

pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
