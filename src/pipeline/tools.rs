use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::pipeline::config::{Os, ToolSearch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    PtoGen,
    Cpfind,
    Cpclean,
    Autooptimiser,
    PanoModify,
    Nona,
    Enblend,
    #[serde(rename = "magick")]
    ImageMagick,
    #[serde(rename = "skyfill")]
    SkyFill,
    #[serde(rename = "exiftool")]
    ExifTool,
}

impl ToolKind {
    /// Tools that must already be installed; the run cannot fetch them.
    pub const MANDATORY: [Self; 8] = [
        Self::PtoGen,
        Self::Cpfind,
        Self::Cpclean,
        Self::Autooptimiser,
        Self::PanoModify,
        Self::Nona,
        Self::Enblend,
        Self::ImageMagick,
    ];

    pub const FETCHABLE: [Self; 2] = [Self::SkyFill, Self::ExifTool];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PtoGen => "pto_gen",
            Self::Cpfind => "cpfind",
            Self::Cpclean => "cpclean",
            Self::Autooptimiser => "autooptimiser",
            Self::PanoModify => "pano_modify",
            Self::Nona => "nona",
            Self::Enblend => "enblend",
            Self::ImageMagick => "magick",
            Self::SkyFill => "skyfill",
            Self::ExifTool => "exiftool",
        }
    }

    /// Command names tried in order. Legacy ImageMagick 6 only ships
    /// `convert`, which on Windows collides with the system `convert.exe`.
    pub fn command_names(self, os: Os) -> Vec<&'static str> {
        match (self, os) {
            (Self::ImageMagick, Os::Windows) => vec!["magick"],
            (Self::ImageMagick, _) => vec!["magick", "convert"],
            (kind, _) => vec![kind.as_str()],
        }
    }

    pub fn is_hugin(self) -> bool {
        matches!(
            self,
            Self::PtoGen
                | Self::Cpfind
                | Self::Cpclean
                | Self::Autooptimiser
                | Self::PanoModify
                | Self::Nona
                | Self::Enblend
        )
    }

    pub fn install_hint(self) -> &'static str {
        match self {
            kind if kind.is_hugin() => {
                "install Hugin (https://hugin.sourceforge.io/download/) and make sure its bin directory is on PATH"
            }
            Self::ImageMagick => {
                "install ImageMagick (https://imagemagick.org/script/download.php) and make sure `magick` is on PATH"
            }
            Self::SkyFill => {
                "download SkyFill from https://stuvelfoto.nl/skyfill/ and put it on PATH"
            }
            _ => {
                "install ExifTool with your package manager (e.g. 'sudo apt install libimage-exiftool-perl')"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    SearchPath,
    KnownDir,
    Cache,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolRef {
    pub kind: ToolKind,
    pub path: PathBuf,
    pub origin: ToolOrigin,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolLocateError {
    #[error("missing dependency: {tool} not found; {hint}")]
    Missing { tool: String, hint: String },
}

impl ToolLocateError {
    pub fn missing(kind: ToolKind) -> Self {
        Self::Missing {
            tool: kind.as_str().to_string(),
            hint: kind.install_hint().to_string(),
        }
    }
}

/// Resolved executables, built once at startup and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedTools {
    tools: BTreeMap<ToolKind, ToolRef>,
}

impl ResolvedTools {
    pub fn insert(&mut self, tool: ToolRef) {
        self.tools.insert(tool.kind, tool);
    }

    pub fn get(&self, kind: ToolKind) -> Option<&ToolRef> {
        self.tools.get(&kind)
    }

    pub fn require(&self, kind: ToolKind) -> Result<&ToolRef, ToolLocateError> {
        self.get(kind).ok_or_else(|| ToolLocateError::missing(kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolRef> {
        self.tools.values()
    }
}

#[derive(Debug, Clone)]
pub struct ToolLocator {
    search: ToolSearch,
}

impl ToolLocator {
    pub fn new(search: ToolSearch) -> Self {
        Self { search }
    }

    pub fn search(&self) -> &ToolSearch {
        &self.search
    }

    /// Search path first, then the platform's known install directories,
    /// then configured extra directories.
    pub fn locate(&self, kind: ToolKind) -> Option<ToolRef> {
        let os = self.search.platform.os;
        for name in kind.command_names(os) {
            let file_name = self.search.platform.executable_name(name);
            if let Some(path) = find_in_dirs(self.search.search_path.iter(), file_name.as_str()) {
                return Some(ToolRef {
                    kind,
                    path,
                    origin: ToolOrigin::SearchPath,
                });
            }
            let mut fallback_dirs = Vec::new();
            if self.search.use_known_dirs {
                fallback_dirs.extend(known_install_dirs(kind, os));
            }
            fallback_dirs.extend(self.search.extra_dirs.iter().cloned());
            if let Some(path) = find_in_dirs(fallback_dirs.iter(), file_name.as_str()) {
                return Some(ToolRef {
                    kind,
                    path,
                    origin: ToolOrigin::KnownDir,
                });
            }
        }
        None
    }

    pub fn locate_mandatory(&self) -> Result<ResolvedTools, ToolLocateError> {
        let mut resolved = ResolvedTools::default();
        for kind in ToolKind::MANDATORY {
            let tool = self
                .locate(kind)
                .ok_or_else(|| ToolLocateError::missing(kind))?;
            debug!(tool = kind.as_str(), path = %tool.path.display(), "resolved tool");
            resolved.insert(tool);
        }
        Ok(resolved)
    }
}

fn find_in_dirs<'a>(dirs: impl Iterator<Item = &'a PathBuf>, file_name: &str) -> Option<PathBuf> {
    dirs.map(|dir| dir.join(file_name))
        .find(|candidate| is_executable_file(candidate.as_path()))
}

pub fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn known_install_dirs(kind: ToolKind, os: Os) -> Vec<PathBuf> {
    match os {
        Os::Windows if kind.is_hugin() => vec![PathBuf::from(r"C:\Program Files\Hugin\bin")],
        Os::Windows if kind == ToolKind::ImageMagick => {
            imagemagick_windows_dirs(Path::new(r"C:\Program Files"))
        }
        Os::Windows => Vec::new(),
        Os::MacOs => {
            let mut dirs = Vec::new();
            if kind.is_hugin() {
                dirs.push(PathBuf::from(
                    "/Applications/Hugin/Hugin.app/Contents/MacOS",
                ));
                dirs.push(PathBuf::from(
                    "/Applications/Hugin/PTBatcherGUI.app/Contents/MacOS",
                ));
            }
            dirs.push(PathBuf::from("/opt/homebrew/bin"));
            dirs.push(PathBuf::from("/usr/local/bin"));
            dirs
        }
        Os::Linux | Os::Other => vec![PathBuf::from("/usr/bin"), PathBuf::from("/usr/local/bin")],
    }
}

/// ImageMagick installs into a versioned folder such as
/// `ImageMagick-7.1.1-Q16-HDRI`; newest name sorts last.
fn imagemagick_windows_dirs(program_files: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(program_files) else {
        return Vec::new();
    };
    let mut dirs = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("ImageMagick"))
                    .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    dirs.sort();
    dirs.reverse();
    dirs
}
