//! On-disk layout of the chart cache.
//!
//! The store knows where packages live and how to rediscover them after a
//! restart. It never decides what to keep; that is the job of
//! [`EvictionPolicy`](crate::EvictionPolicy).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

use crate::artifact::{ChartId, Variant, artifact_file_name, parse_artifact_file_name};
use crate::error::{CacheError, Result};

/// Local copy of the last successfully fetched chart index.
pub const INDEX_FILE: &str = "index.json";

/// Persisted recency order, least recently used first.
pub const RECENCY_FILE: &str = "recency.json";

/// Prefix of scoped directories used while deriving light packages.
pub const DERIVE_DIR_PREFIX: &str = ".derive-";

/// Id → path maps for both variants.
///
/// An id whose heavy package has no video maps to the same path in both
/// maps (the alias case).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantMaps {
    /// Heavy packages.
    pub heavy: HashMap<ChartId, PathBuf>,
    /// Light packages, distinct or aliased.
    pub light: HashMap<ChartId, PathBuf>,
}

impl VariantMaps {
    /// Look up the path registered for a variant.
    #[must_use]
    pub fn get(&self, id: ChartId, variant: Variant) -> Option<&PathBuf> {
        self.map(variant).get(&id)
    }

    /// Register a path for a variant, replacing any previous entry.
    pub fn insert(&mut self, id: ChartId, variant: Variant, path: PathBuf) {
        self.map_mut(variant).insert(id, path);
    }

    /// Drop the entry for a variant.
    pub fn remove(&mut self, id: ChartId, variant: Variant) -> Option<PathBuf> {
        self.map_mut(variant).remove(&id)
    }

    /// Whether the light entry points at the heavy package.
    #[must_use]
    pub fn is_alias(&self, id: ChartId) -> bool {
        match (self.heavy.get(&id), self.light.get(&id)) {
            (Some(heavy), Some(light)) => heavy == light,
            _ => false,
        }
    }

    /// Number of light entries that alias their heavy package.
    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.light.keys().filter(|id| self.is_alias(**id)).count()
    }

    fn map(&self, variant: Variant) -> &HashMap<ChartId, PathBuf> {
        match variant {
            Variant::Heavy => &self.heavy,
            Variant::Light => &self.light,
        }
    }

    fn map_mut(&mut self, variant: Variant) -> &mut HashMap<ChartId, PathBuf> {
        match variant {
            Variant::Heavy => &mut self.heavy,
            Variant::Light => &mut self.light,
        }
    }
}

/// What a directory scan found.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Packages found on disk.
    pub maps: VariantMaps,
    /// Every id with at least one package, oldest modification first.
    pub discovered: Vec<ChartId>,
    /// Leftover temporary files and directories that were removed.
    pub stale_removed: usize,
}

/// The cache directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `root`. Nothing is touched on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical path for a package.
    #[must_use]
    pub fn path_for(&self, id: ChartId, variant: Variant) -> PathBuf {
        self.root.join(artifact_file_name(id, variant))
    }

    /// Path of the local index copy.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Path of the persisted recency hint.
    #[must_use]
    pub fn recency_path(&self) -> PathBuf {
        self.root.join(RECENCY_FILE)
    }

    /// Create the cache directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| CacheError::io(e, &self.root, "create_dir_all"))
    }

    /// Scan the cache directory.
    ///
    /// Creates the directory if it does not exist and removes temporary
    /// files left behind by interrupted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn scan(&self) -> Result<ScanResult> {
        self.ensure_dir()?;

        let mut result = ScanResult::default();
        let mut modified: HashMap<ChartId, SystemTime> = HashMap::new();

        let entries = fs::read_dir(&self.root).map_err(|e| CacheError::io(e, &self.root, "read_dir"))?;
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(e, &self.root, "read_dir_entry"))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };

            if is_temporary(&name) {
                if remove_stale(&path) {
                    result.stale_removed += 1;
                }
                continue;
            }

            let Some((id, variant)) = parse_artifact_file_name(&name) else {
                trace!(?path, "Ignoring unrelated file in cache directory");
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!(?path, error = %e, "Failed to stat cached package; skipping");
                    continue;
                }
            };

            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            modified
                .entry(id)
                .and_modify(|t| *t = (*t).max(mtime))
                .or_insert(mtime);
            result.maps.insert(id, variant, path);
        }

        let mut discovered: Vec<(SystemTime, ChartId)> =
            modified.into_iter().map(|(id, t)| (t, id)).collect();
        discovered.sort();
        result.discovered = discovered.into_iter().map(|(_, id)| id).collect();

        debug!(
            root = ?self.root,
            heavy = result.maps.heavy.len(),
            light = result.maps.light.len(),
            stale = result.stale_removed,
            "Scanned chart cache"
        );
        Ok(result)
    }

    /// Load the persisted recency order.
    ///
    /// A missing hint is empty; a corrupt one is logged and treated as empty.
    #[must_use]
    pub fn load_recency_hint(&self) -> Vec<ChartId> {
        let path = self.recency_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(?path, error = %e, "Failed to read recency hint; ignoring it");
                return Vec::new();
            }
        };
        match serde_json::from_slice(&content) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(?path, error = %e, "Corrupt recency hint; ignoring it");
                Vec::new()
            }
        }
    }

    /// Persist the recency order.
    ///
    /// # Errors
    ///
    /// Returns an error if the hint file cannot be written.
    pub fn save_recency_hint(&self, ids: &[ChartId]) -> Result<()> {
        let path = self.recency_path();
        let content = serde_json::to_vec(ids).map_err(|e| {
            CacheError::io(std::io::Error::other(e), &path, "serialize")
        })?;
        write_atomic(&path, &content).map_err(|e| CacheError::io(e, &path, "write"))
    }
}

/// Build the initial recency order.
///
/// Hint ids that still have a package on disk come first, in hint order;
/// discovered ids missing from the hint follow in discovery order.
#[must_use]
pub fn seed_recency(hint: &[ChartId], scan: &ScanResult) -> Vec<ChartId> {
    let on_disk: HashSet<ChartId> = scan.discovered.iter().copied().collect();
    let mut seen = HashSet::with_capacity(on_disk.len());
    let mut order = Vec::with_capacity(on_disk.len());

    for id in hint.iter().chain(scan.discovered.iter()) {
        if on_disk.contains(id) && seen.insert(*id) {
            order.push(*id);
        }
    }
    order
}

/// Write `data` to `path` through a temporary sibling and a rename, so
/// readers never observe a partial file.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be written or renamed.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let prefix = temp_prefix(path);
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Prefix for temporary siblings of `path`: `.<file name>.`
#[must_use]
pub fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    format!(".{name}.")
}

/// Whether a directory entry is an in-progress write or derive scratch dir.
#[must_use]
pub fn is_temporary(name: &str) -> bool {
    name.starts_with(DERIVE_DIR_PREFIX) || (name.starts_with('.') && name.ends_with(".tmp"))
}

fn remove_stale(path: &Path) -> bool {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => {
            debug!(?path, "Removed stale temporary file");
            true
        }
        Err(e) => {
            warn!(?path, error = %e, "Failed to remove stale temporary file");
            false
        }
    }
}
