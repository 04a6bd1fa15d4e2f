//! Fetcher for the optional tools (SkyFill, ExifTool).
//!
//! A tool found on the search path is used as is. Otherwise the local tools
//! cache is consulted, and only when that is empty is the platform archive
//! downloaded, extracted and verified. A populated cache never touches the
//! network.

pub mod archive;
pub mod sources;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;

use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::pipeline::config::{FetchSettings, Os, Platform};
use crate::pipeline::tools::{
    is_executable_file, ToolKind, ToolLocateError, ToolLocator, ToolOrigin, ToolRef,
};

use crate::pipeline::digest::sha256_file;

use self::archive::{extract_archive, find_file, hoist_directory, make_executable};
use self::sources::{default_sources, FetchSource};

/// ExifTool's Windows build pauses for a key press under this name.
const EXIFTOOL_PAUSING_EXE: &str = "exiftool(-k).exe";
/// Progress interval when the server sends no content length.
const PROGRESS_STEP_BYTES: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Missing(#[from] ToolLocateError),
    #[error("invalid download URL for {tool}: {url}")]
    InvalidUrl { tool: String, url: String },
    #[error("download failed for {tool} from {url} after {attempts} attempt(s): {message}")]
    Download {
        tool: String,
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("checksum mismatch for {tool}: expected {expected}, got {actual}")]
    Checksum {
        tool: String,
        expected: String,
        actual: String,
    },
    #[error("extraction failed for {tool}: {message}")]
    Extraction { tool: String, message: String },
    #[error("tools cache error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait ArchiveDownloader: Send + Sync + 'static {
    /// Writes the body at `url` to `dest` and returns the byte count.
    fn download(&self, url: &str, dest: &Path) -> Result<u64, String>;
}

#[derive(Debug, Clone)]
pub struct HttpArchiveDownloader {
    client: Client,
}

impl HttpArchiveDownloader {
    pub fn new(settings: &FetchSettings) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| format!("http client init failed: {e}"))?;
        Ok(Self { client })
    }
}

impl ArchiveDownloader for HttpArchiveDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<u64, String> {
        let mut response = self
            .client
            .get(url)
            .header(USER_AGENT, concat!("dji-pano-stitcher/", env!("CARGO_PKG_VERSION")))
            .send()
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let total = response.content_length();
        debug!(url, content_length = ?total, "downloading archive");
        let file = File::create(dest).map_err(|e| e.to_string())?;
        let mut sink = ProgressWriter::new(file, url, total);
        let bytes = io::copy(&mut response, &mut sink).map_err(|e| e.to_string())?;
        sink.flush().map_err(|e| e.to_string())?;
        debug!(url, bytes, progress_lines = sink.reports, "download finished");
        Ok(bytes)
    }
}

/// Counts bytes on their way to `inner` and logs every tenth of the
/// expected size, or every MiB when the size is unknown.
struct ProgressWriter<'a, W> {
    inner: W,
    url: &'a str,
    total: Option<u64>,
    written: u64,
    next_report: u64,
    reports: u32,
}

impl<'a, W: Write> ProgressWriter<'a, W> {
    fn new(inner: W, url: &'a str, total: Option<u64>) -> Self {
        let mut writer = Self {
            inner,
            url,
            total,
            written: 0,
            next_report: 0,
            reports: 0,
        };
        writer.next_report = writer.step();
        writer
    }

    fn step(&self) -> u64 {
        match self.total {
            Some(total) if total > 0 => total.div_ceil(10),
            _ => PROGRESS_STEP_BYTES,
        }
    }

    fn report(&mut self) {
        match self.total {
            Some(total) if total > 0 => {
                let percent = (self.written.saturating_mul(100) / total).min(100);
                debug!(url = self.url, percent, bytes = self.written, "download progress");
            }
            _ => debug!(url = self.url, bytes = self.written, "download progress"),
        }
        self.reports += 1;
        let step = self.step();
        self.next_report = (self.written / step + 1) * step;
    }
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if self.written >= self.next_report {
            self.report();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct ToolFetcher<D> {
    downloader: D,
    tools_dir: PathBuf,
    settings: FetchSettings,
    platform: Platform,
    sources: BTreeMap<ToolKind, FetchSource>,
}

impl<D> ToolFetcher<D>
where
    D: ArchiveDownloader,
{
    pub fn new(
        downloader: D,
        tools_dir: PathBuf,
        settings: FetchSettings,
        platform: Platform,
    ) -> Self {
        Self {
            downloader,
            tools_dir,
            settings,
            platform,
            sources: default_sources(platform),
        }
    }

    pub fn with_source(mut self, kind: ToolKind, source: FetchSource) -> Self {
        self.sources.insert(kind, source);
        self
    }

    pub fn cache_dir(&self, kind: ToolKind) -> PathBuf {
        self.tools_dir.join(kind.as_str())
    }

    /// Resolves `kind` from the search path, the cache, or a fresh download.
    pub fn ensure(&self, kind: ToolKind, locator: &ToolLocator) -> Result<ToolRef, FetchError> {
        if let Some(found) = self.find_existing(kind, locator) {
            return Ok(found);
        }
        let source = self
            .sources
            .get(&kind)
            .ok_or_else(|| ToolLocateError::missing(kind))?;
        let path = self.download_and_install(kind, source)?;
        Ok(ToolRef {
            kind,
            path,
            origin: ToolOrigin::Downloaded,
        })
    }

    /// Search path or cache, never the network.
    pub fn find_existing(&self, kind: ToolKind, locator: &ToolLocator) -> Option<ToolRef> {
        if let Some(found) = locator.locate(kind) {
            return Some(found);
        }
        let path = self.cached_executable(kind)?;
        debug!(tool = kind.as_str(), path = %path.display(), "using cached tool");
        Some(ToolRef {
            kind,
            path,
            origin: ToolOrigin::Cache,
        })
    }

    pub fn has_source(&self, kind: ToolKind) -> bool {
        self.sources.contains_key(&kind)
    }

    fn executable_name(&self, kind: ToolKind) -> String {
        self.platform.executable_name(kind.as_str())
    }

    fn cached_executable(&self, kind: ToolKind) -> Option<PathBuf> {
        let cache_dir = self.cache_dir(kind);
        if !cache_dir.is_dir() {
            return None;
        }
        find_file(cache_dir.as_path(), self.executable_name(kind).as_str())
            .filter(|path| is_executable_file(path.as_path()))
    }

    fn download_and_install(
        &self,
        kind: ToolKind,
        source: &FetchSource,
    ) -> Result<PathBuf, FetchError> {
        let tool = kind.as_str().to_string();
        let url = Url::parse(source.url.as_str())
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| FetchError::InvalidUrl {
                tool: tool.clone(),
                url: source.url.clone(),
            })?;

        let cache_dir = self.cache_dir(kind);
        fs::create_dir_all(cache_dir.as_path()).map_err(|source| FetchError::Io {
            path: cache_dir.clone(),
            source,
        })?;
        let archive_path = cache_dir.join(source.archive_file_name(kind));

        info!(tool = tool.as_str(), url = %url, "downloading");
        let bytes = self.download_with_retries(kind, url.as_str(), archive_path.as_path())?;
        debug!(tool = tool.as_str(), bytes, "download complete");

        if let Some(expected) = source.sha256.as_deref() {
            let actual = sha256_file(archive_path.as_path()).map_err(|source| FetchError::Io {
                path: archive_path.clone(),
                source,
            })?;
            if actual != expected {
                let _ = fs::remove_file(archive_path.as_path());
                return Err(FetchError::Checksum {
                    tool,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        info!(tool = tool.as_str(), "extracting");
        let extracted =
            extract_archive(source.archive, archive_path.as_path(), cache_dir.as_path());
        let _ = fs::remove_file(archive_path.as_path());
        extracted.map_err(|e| FetchError::Extraction {
            tool: tool.clone(),
            message: e.to_string(),
        })?;

        let exe = self.install_extracted(kind, cache_dir.as_path())?;
        if !is_executable_file(exe.as_path()) {
            return Err(FetchError::Extraction {
                tool,
                message: format!("{} is not executable after extraction", exe.display()),
            });
        }
        Ok(exe)
    }

    fn download_with_retries(
        &self,
        kind: ToolKind,
        url: &str,
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let attempts = self.settings.attempts.max(1);
        let mut delay = self.settings.backoff;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.downloader.download(url, dest) {
                Ok(bytes) => return Ok(bytes),
                Err(message) => {
                    warn!(
                        tool = kind.as_str(),
                        attempt,
                        attempts,
                        error = message.as_str(),
                        "download attempt failed"
                    );
                    let _ = fs::remove_file(dest);
                    last_error = message;
                    if attempt < attempts {
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        Err(FetchError::Download {
            tool: kind.as_str().to_string(),
            url: url.to_string(),
            attempts,
            message: last_error,
        })
    }

    /// Locates the executable in the extracted tree, applies ExifTool's
    /// Windows renaming and layout fixups, and marks it executable.
    fn install_extracted(&self, kind: ToolKind, cache_dir: &Path) -> Result<PathBuf, FetchError> {
        let tool = kind.as_str().to_string();
        let exe_name = self.executable_name(kind);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| FetchError::Io { path, source }
        };

        let mut exe = find_file(cache_dir, exe_name.as_str());
        if exe.is_none() && kind == ToolKind::ExifTool && self.platform.os == Os::Windows {
            if let Some(pausing) = find_file(cache_dir, EXIFTOOL_PAUSING_EXE) {
                let renamed = pausing.with_file_name(exe_name.as_str());
                fs::rename(pausing.as_path(), renamed.as_path())
                    .map_err(io_err(pausing.as_path()))?;
                exe = Some(renamed);
            }
        }
        let Some(mut exe) = exe else {
            return Err(FetchError::Extraction {
                tool,
                message: format!("{exe_name} not found in downloaded archive"),
            });
        };

        if let Some(parent) = exe.parent().map(Path::to_path_buf) {
            if parent != cache_dir {
                hoist_directory(parent.as_path(), cache_dir).map_err(io_err(parent.as_path()))?;
                exe = cache_dir.join(exe_name.as_str());
            }
        }
        make_executable(exe.as_path()).map_err(io_err(exe.as_path()))?;
        Ok(exe)
    }
}
