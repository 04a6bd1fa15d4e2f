use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use walkdir::WalkDir;
use zip::ZipArchive;

use super::sources::ArchiveKind;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub fn extract_archive(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::TarGz => extract_tar_gz(archive, dest),
    }
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let reader = BufReader::new(File::open(archive_path)?);
    let mut archive = ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => dest_dir.join(path),
            None => continue,
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        io::copy(&mut entry, &mut outfile)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let decoder = GzDecoder::new(BufReader::new(File::open(archive_path)?));
    let mut archive = tar::Archive::new(decoder);
    // `unpack` refuses entries that would escape `dest_dir`.
    archive.unpack(dest_dir)?;
    Ok(())
}

/// Shallowest file named `file_name` below `root`.
pub fn find_file(root: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .min_by_key(|entry| entry.depth())
        .map(|entry| entry.into_path())
}

/// Moves every entry of `nested` into `root` and removes `nested`.
pub fn hoist_directory(nested: &Path, root: &Path) -> Result<(), io::Error> {
    for entry in fs::read_dir(nested)? {
        let entry = entry?;
        let target = root.join(entry.file_name());
        if target.exists() {
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_file(&target)?;
            }
        }
        fs::rename(entry.path(), target)?;
    }
    fs::remove_dir(nested)
}

pub fn make_executable(path: &Path) -> Result<(), io::Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{tar_gz_bytes, zip_bytes};
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pano_archive_{tag}_{stamp}"));
        fs::create_dir_all(dir.as_path()).expect("temp dir should exist");
        dir
    }

    #[test]
    fn extracts_zip_with_nested_folders() {
        let dir = temp_dir("zip");
        let archive = dir.join("a.zip");
        fs::write(
            archive.as_path(),
            zip_bytes(&[
                ("pkg/exiftool(-k).exe", b"exe".as_slice()),
                ("pkg/exiftool_files/perl.dll", b"dll".as_slice()),
            ]),
        )
        .expect("archive write");
        let dest = dir.join("out");

        extract_archive(ArchiveKind::Zip, archive.as_path(), dest.as_path())
            .expect("zip should extract");
        assert_eq!(
            fs::read(dest.join("pkg/exiftool_files/perl.dll")).expect("dll extracted"),
            b"dll"
        );
    }

    #[test]
    fn extracts_tar_gz() {
        let dir = temp_dir("targz");
        let archive = dir.join("a.tar.gz");
        fs::write(
            archive.as_path(),
            tar_gz_bytes(&[("skyfill-v1.6/skyfill", b"bin".as_slice())]),
        )
        .expect("archive write");
        let dest = dir.join("out");
        fs::create_dir_all(dest.as_path()).expect("dest dir");

        extract_archive(ArchiveKind::TarGz, archive.as_path(), dest.as_path())
            .expect("tar.gz should extract");
        assert_eq!(
            find_file(dest.as_path(), "skyfill"),
            Some(dest.join("skyfill-v1.6/skyfill"))
        );
    }

    #[test]
    fn garbage_zip_is_an_error() {
        let dir = temp_dir("garbage");
        let archive = dir.join("bad.zip");
        fs::write(archive.as_path(), b"<html>not found</html>").expect("write");

        let err = extract_archive(ArchiveKind::Zip, archive.as_path(), dir.join("out").as_path())
            .expect_err("html is not a zip");
        assert!(matches!(err, ArchiveError::Zip(_)));
    }

    #[test]
    fn find_file_prefers_shallowest_match() {
        let dir = temp_dir("find");
        fs::create_dir_all(dir.join("a/b")).expect("nested dirs");
        fs::write(dir.join("a/b/tool"), b"deep").expect("deep");
        fs::write(dir.join("a/tool"), b"shallow").expect("shallow");

        assert_eq!(find_file(dir.as_path(), "tool"), Some(dir.join("a/tool")));
        assert_eq!(find_file(dir.as_path(), "other"), None);
    }

    #[test]
    fn hoist_moves_contents_and_removes_folder() {
        let dir = temp_dir("hoist");
        let nested = dir.join("exiftool-13.45_64");
        fs::create_dir_all(nested.join("exiftool_files")).expect("nested");
        fs::write(nested.join("exiftool.exe"), b"exe").expect("exe");

        hoist_directory(nested.as_path(), dir.as_path()).expect("hoist should work");
        assert!(dir.join("exiftool.exe").is_file());
        assert!(dir.join("exiftool_files").is_dir());
        assert!(!nested.exists());
    }
}
