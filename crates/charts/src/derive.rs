//! Light package derivation.
//!
//! A light package is the heavy package minus its embedded video. When the
//! heavy package has no video there is nothing to strip, and the heavy file
//! itself serves as the light package.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::artifact::{ChartId, Variant, artifact_file_name, parse_artifact_file_name};
use crate::config::CacheConfig;
use crate::error::DerivationError;
use crate::package;
use crate::store::{DERIVE_DIR_PREFIX, temp_prefix};

/// Outcome of a derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derived {
    /// No video found; the heavy path doubles as the light path.
    Alias(PathBuf),
    /// A new video-free package was written.
    Stripped(PathBuf),
}

impl Derived {
    /// Path of the light package.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Alias(path) | Self::Stripped(path) => path,
        }
    }

    /// Consume into the light package path.
    #[must_use]
    pub fn into_path(self) -> PathBuf {
        match self {
            Self::Alias(path) | Self::Stripped(path) => path,
        }
    }

    /// Whether no new file was written.
    #[must_use]
    pub fn is_alias(&self) -> bool {
        matches!(self, Self::Alias(_))
    }
}

/// Builds light packages from heavy ones.
#[derive(Debug, Clone)]
pub struct VariantDeriver {
    video_extensions: Vec<String>,
}

impl VariantDeriver {
    /// Create a deriver that strips entries with the given extensions.
    #[must_use]
    pub fn new<I, S>(video_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            video_extensions: video_extensions
                .into_iter()
                .map(Into::into)
                .map(|ext: String| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    /// Create a deriver from the configured video extensions.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.video_extensions.iter().cloned())
    }

    /// Extensions treated as video.
    #[must_use]
    pub fn video_extensions(&self) -> &[String] {
        &self.video_extensions
    }

    /// Derive the light package for `heavy_path`.
    ///
    /// The work happens in a scratch directory next to the package, which is
    /// removed on every exit path. The light package is written to a
    /// temporary file and renamed into place, so an error never leaves a file
    /// at the light path.
    ///
    /// # Errors
    ///
    /// Returns an error if `heavy_path` is not a canonical heavy package name,
    /// the package is corrupt, or a filesystem operation fails.
    pub fn derive(&self, heavy_path: &Path) -> Result<Derived, DerivationError> {
        let id = heavy_id(heavy_path)?;
        let videos = package::video_entries(heavy_path, &self.video_extensions)?;
        if videos.is_empty() {
            debug!(%id, path = ?heavy_path, "Package has no video; light aliases heavy");
            return Ok(Derived::Alias(heavy_path.to_path_buf()));
        }

        let dir = heavy_path.parent().unwrap_or_else(|| Path::new("."));
        let light_path = dir.join(artifact_file_name(id, Variant::Light));

        let scratch = tempfile::Builder::new()
            .prefix(DERIVE_DIR_PREFIX)
            .tempdir_in(dir)
            .map_err(|e| DerivationError::io(e, dir, "create scratch dir"))?;

        let entries = extract_all(heavy_path, scratch.path())?;
        for entry in entries
            .iter()
            .filter(|e| !e.is_dir && package::is_video_entry(&e.name, &self.video_extensions))
        {
            let path = scratch.path().join(&entry.relative);
            fs::remove_file(&path).map_err(|e| DerivationError::io(e, &path, "remove video"))?;
        }
        let written = repackage(&entries, scratch.path(), &light_path)?;

        info!(
            %id,
            stripped = ?videos,
            entries = written,
            path = ?light_path,
            "Derived light package"
        );
        Ok(Derived::Stripped(light_path))
    }
}

fn heavy_id(path: &Path) -> Result<ChartId, DerivationError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_artifact_file_name)
        .and_then(|(id, variant)| (variant == Variant::Heavy).then_some(id))
        .ok_or_else(|| DerivationError::InvalidName {
            path: path.to_path_buf(),
        })
}

/// A package entry as laid out in the scratch directory.
#[derive(Debug)]
struct ExtractedEntry {
    name: String,
    relative: PathBuf,
    is_dir: bool,
    unix_mode: Option<u32>,
}

fn extract_all(package: &Path, dest: &Path) -> Result<Vec<ExtractedEntry>, DerivationError> {
    let mut archive = package::open_archive(package)?;
    let mut entries = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| DerivationError::archive(package, e.to_string()))?;
        let name = file.name().to_string();
        let Some(relative) = file.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!(?package, entry = %name, "Skipping package entry with unsafe path");
            continue;
        };

        let outpath = dest.join(&relative);
        let is_dir = file.is_dir();
        if is_dir {
            fs::create_dir_all(&outpath)
                .map_err(|e| DerivationError::io(e, &outpath, "create_dir_all"))?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| DerivationError::io(e, parent, "create_dir_all"))?;
            }
            let mut out =
                File::create(&outpath).map_err(|e| DerivationError::io(e, &outpath, "create"))?;
            io::copy(&mut file, &mut out).map_err(|e| DerivationError::io(e, &outpath, "extract"))?;
        }

        entries.push(ExtractedEntry {
            name,
            relative,
            is_dir,
            unix_mode: file.unix_mode(),
        });
    }

    Ok(entries)
}

/// Zip what remains of `entries` under `root` into `dest`, in archive order.
///
/// Returns the number of entries written.
fn repackage(
    entries: &[ExtractedEntry],
    root: &Path,
    dest: &Path,
) -> Result<usize, DerivationError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let prefix = temp_prefix(dest);
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| DerivationError::io(e, dir, "create temp file"))?;

    let mut written = 0;
    {
        let mut writer = ZipWriter::new(tmp.as_file_mut());
        for entry in entries {
            let source = root.join(&entry.relative);
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            let options = match entry.unix_mode {
                Some(mode) => options.unix_permissions(mode),
                None => options,
            };

            if entry.is_dir {
                writer
                    .add_directory(entry.name.as_str(), options)
                    .map_err(|e| DerivationError::archive(dest, e.to_string()))?;
                written += 1;
                continue;
            }
            // Stripped entries are gone from the scratch directory.
            if !source.exists() {
                continue;
            }

            writer
                .start_file(entry.name.as_str(), options)
                .map_err(|e| DerivationError::archive(dest, e.to_string()))?;
            let mut input =
                File::open(&source).map_err(|e| DerivationError::io(e, &source, "open"))?;
            io::copy(&mut input, &mut writer)
                .map_err(|e| DerivationError::io(e, dest, "write entry"))?;
            written += 1;
        }

        writer
            .finish()
            .map_err(|e| DerivationError::archive(dest, e.to_string()))?;
    }

    tmp.as_file()
        .sync_all()
        .map_err(|e| DerivationError::io(e, dest, "sync"))?;
    tmp.persist(dest)
        .map_err(|e| DerivationError::io(e.error, dest, "persist"))?;
    Ok(written)
}
