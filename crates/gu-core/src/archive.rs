//! ZIP package extraction into the staging area.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive entry escapes the destination: {0}")]
    UnsafeEntry(String),
}

/// Extract `archive` into `destination`; returns the extracted file paths.
///
/// Entries with absolute paths or `..` components are rejected before
/// anything is written.
pub fn decompress(archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArchiveError::Io { path, source }
    };
    let zip_err = |source| ArchiveError::Zip {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(io_err(archive))?;
    let mut zip = ZipArchive::new(file).map_err(zip_err)?;

    // Validate every name first so a bad entry leaves nothing behind.
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(zip_err)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeEntry(entry.name().to_string()))?;
        names.push((relative, entry.is_dir()));
    }

    fs::create_dir_all(destination).map_err(io_err(destination))?;
    let mut extracted = Vec::new();
    for (i, (relative, is_dir)) in names.into_iter().enumerate() {
        let out_path = destination.join(&relative);
        if is_dir {
            fs::create_dir_all(&out_path).map_err(io_err(&out_path))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        let mut out = File::create(&out_path).map_err(io_err(&out_path))?;
        io::copy(&mut entry, &mut out).map_err(io_err(&out_path))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777));
        }
        extracted.push(out_path);
    }
    Ok(extracted)
}
