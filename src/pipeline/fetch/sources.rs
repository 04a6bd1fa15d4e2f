use std::collections::BTreeMap;

use crate::pipeline::config::{Os, Platform};
use crate::pipeline::tools::ToolKind;

pub const SKYFILL_WINDOWS_URL: &str =
    "https://stuvelfoto.nl/downloads/skyfill/skyfill-v1.6-windows.zip";
pub const SKYFILL_LINUX_URL: &str =
    "https://stuvelfoto.nl/downloads/skyfill/skyfill-v1.6-linux.tar.gz";
pub const EXIFTOOL_WINDOWS_URL: &str =
    "https://sourceforge.net/projects/exiftool/files/exiftool-13.45_64.zip/download";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSource {
    pub url: String,
    pub archive: ArchiveKind,
    /// Lowercase hex SHA-256 of the archive, when pinned.
    pub sha256: Option<String>,
}

impl FetchSource {
    pub fn new(url: impl Into<String>, archive: ArchiveKind) -> Self {
        Self {
            url: url.into(),
            archive,
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }

    pub fn archive_file_name(&self, kind: ToolKind) -> String {
        format!("{}-download.{}", kind.as_str(), self.archive.extension())
    }
}

/// Download sources for tools that may be fetched on `platform`. Tools
/// without an entry have to be installed by the user.
pub fn default_sources(platform: Platform) -> BTreeMap<ToolKind, FetchSource> {
    let mut out = BTreeMap::new();
    match platform.os {
        Os::Windows => {
            out.insert(
                ToolKind::SkyFill,
                FetchSource::new(SKYFILL_WINDOWS_URL, ArchiveKind::Zip),
            );
            out.insert(
                ToolKind::ExifTool,
                FetchSource::new(EXIFTOOL_WINDOWS_URL, ArchiveKind::Zip),
            );
        }
        Os::Linux => {
            out.insert(
                ToolKind::SkyFill,
                FetchSource::new(SKYFILL_LINUX_URL, ArchiveKind::TarGz),
            );
        }
        Os::MacOs | Os::Other => {}
    }
    out
}
