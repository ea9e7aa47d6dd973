//! Unpacks gzip-compressed chart archives into fresh temporary directories.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::error::{ChartError, ExtractError};

const DIR_MODE: u32 = 0o755;
/// Permission bits only; special bits from the archive are dropped.
const FILE_MODE_MASK: u32 = 0o777;

/// Extract `archive` into a new directory under the system temp dir.
///
/// The returned directory belongs to the caller and is never cleaned up here.
pub fn extract(archive: &Path) -> Result<PathBuf, ChartError> {
    extract_in(archive, &std::env::temp_dir())
}

/// Extract `archive` into a new, uniquely named directory inside `parent`.
///
/// On failure the partially populated directory is removed.
pub fn extract_in(archive: &Path, parent: &Path) -> Result<PathBuf, ChartError> {
    let file = File::open(archive).map_err(|err| ChartError::extraction(archive, err.into()))?;
    let dest = tempfile::Builder::new()
        .prefix("chart-")
        .tempdir_in(parent)
        .map_err(|err| ChartError::extraction(archive, err.into()))?;

    unpack(file, dest.path()).map_err(|err| ChartError::extraction(archive, err))?;
    tracing::debug!(
        archive = %archive.display(),
        dest = %dest.path().display(),
        "extracted chart archive"
    );
    Ok(dest.keep())
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<(), ExtractError> {
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(reader)));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        if matches!(
            entry_type,
            EntryType::XGlobalHeader
                | EntryType::XHeader
                | EntryType::GNULongName
                | EntryType::GNULongLink
        ) {
            continue;
        }

        let raw_path = entry.path()?.into_owned();
        let relative = confined_path(&raw_path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, DIR_MODE)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                let mode = entry.header().mode()?;
                set_mode(&target, mode & FILE_MODE_MASK)?;
            }
            other => {
                return Err(ExtractError::UnsupportedEntry {
                    path: raw_path.display().to_string(),
                    kind: format!("{other:?}"),
                });
            }
        }
    }
    Ok(())
}

/// Relative path of an entry, rejecting anything that could land outside `dest`.
fn confined_path(raw: &Path) -> Result<PathBuf, ExtractError> {
    let mut relative = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath {
                    path: raw.display().to_string(),
                });
            }
        }
    }
    Ok(relative)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
