//! Read-only inspection of chart packages (zip archives).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use zip::ZipArchive;

use crate::error::DerivationError;

/// Name of the chart description entry inside a package.
pub const MAIDATA_ENTRY: &str = "maidata.txt";

/// Open a package for reading.
pub(crate) fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, DerivationError> {
    let file = File::open(path).map_err(|e| DerivationError::io(e, path, "open"))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| DerivationError::archive(path, e.to_string()))
}

/// Whether an entry name refers to an embedded video.
///
/// Matches on the extension of the last path component, case-insensitively.
#[must_use]
pub fn is_video_entry(name: &str, video_extensions: &[String]) -> bool {
    if name.ends_with('/') {
        return false;
    }
    let file_name = name.rsplit('/').next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => video_extensions
            .iter()
            .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// Names of every entry in a package, in archive order.
///
/// # Errors
///
/// Returns an error if the package cannot be opened or is not a zip archive.
pub fn entry_names(path: &Path) -> Result<Vec<String>, DerivationError> {
    let archive = open_archive(path)?;
    Ok(archive.file_names().map(str::to_owned).collect())
}

/// Names of the video entries in a package.
///
/// # Errors
///
/// Returns an error if the package cannot be opened or is not a zip archive.
pub fn video_entries(
    path: &Path,
    video_extensions: &[String],
) -> Result<Vec<String>, DerivationError> {
    Ok(entry_names(path)?
        .into_iter()
        .filter(|name| is_video_entry(name, video_extensions))
        .collect())
}

/// Read the chart title from the package's `maidata.txt`.
///
/// The title is the value of the `&title=` field on the first line. Returns
/// `None` when the entry or the field is missing.
///
/// # Errors
///
/// Returns an error if the package cannot be read.
pub fn read_title(path: &Path) -> Result<Option<String>, DerivationError> {
    let mut archive = open_archive(path)?;
    let Some(name) = archive
        .file_names()
        .find(|name| name.eq_ignore_ascii_case(MAIDATA_ENTRY))
        .map(str::to_owned)
    else {
        return Ok(None);
    };

    let entry = archive
        .by_name(&name)
        .map_err(|e| DerivationError::archive(path, e.to_string()))?;
    let mut first_line = Vec::new();
    BufReader::new(entry)
        .read_until(b'\n', &mut first_line)
        .map_err(|e| DerivationError::io(e, path, "read maidata"))?;

    let line = String::from_utf8_lossy(&first_line);
    Ok(line
        .trim()
        .split_once("&title=")
        .map(|(_, title)| title.trim().to_string())
        .filter(|title| !title.is_empty()))
}
