//! Recency tracking and reclamation.
//!
//! Reclaiming leaves three tiers behind: the most recent ids keep both
//! variants, older survivors keep their heavy package (and any distinct light
//! package) but lose light aliases, and evicted ids keep nothing.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::artifact::{ChartId, Variant};
use crate::config::MIN_CAPACITY;
use crate::store::VariantMaps;

/// Ids ordered from least to most recently used, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecencyList {
    ids: Vec<ChartId>,
}

impl RecencyList {
    /// Build a list from ids in least-recent-first order.
    ///
    /// A repeated id keeps its last position.
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = ChartId>) -> Self {
        let mut list = Self::default();
        for id in ids {
            list.touch(id);
        }
        list
    }

    /// Move `id` to the most recent position, inserting it if absent.
    pub fn touch(&mut self, id: ChartId) {
        self.remove(id);
        self.ids.push(id);
    }

    /// Remove `id`. Returns whether it was present.
    pub fn remove(&mut self, id: ChartId) -> bool {
        match self.ids.iter().position(|x| *x == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether `id` is tracked.
    #[must_use]
    pub fn contains(&self, id: ChartId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of tracked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids, least recent first.
    #[must_use]
    pub fn as_slice(&self) -> &[ChartId] {
        &self.ids
    }

    /// Remove and return the `count` least recent ids.
    pub fn drain_oldest(&mut self, count: usize) -> Vec<ChartId> {
        let count = count.min(self.ids.len());
        self.ids.drain(..count).collect()
    }
}

/// What a reclaim pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Ids removed from the recency list and both maps.
    pub evicted: Vec<ChartId>,
    /// Ids whose light alias entry was dropped.
    pub unaliased: Vec<ChartId>,
    /// Package files of evicted ids, no longer registered and not yet deleted.
    pub orphaned: Vec<PathBuf>,
}

impl ReclaimReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.unaliased.is_empty()
    }

    /// Delete the orphaned files, best-effort.
    ///
    /// Failures are logged and skipped. Blocking.
    #[must_use]
    pub fn remove_orphaned(&self) -> RemovedFiles {
        let mut removed = RemovedFiles::default();
        for path in &self.orphaned {
            if let Some(bytes) = remove_package(path) {
                removed.count += 1;
                removed.bytes += bytes;
            }
        }
        if removed.count > 0 {
            debug!(
                files = removed.count,
                bytes = removed.bytes,
                "Deleted evicted packages"
            );
        }
        removed
    }
}

/// Files deleted after a reclaim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedFiles {
    /// Package files deleted.
    pub count: usize,
    /// Bytes freed.
    pub bytes: u64,
}

/// Capacity-bounded least-recently-used policy.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    recency: RecencyList,
    capacity: usize,
}

impl EvictionPolicy {
    /// Create a policy over an initial recency order.
    ///
    /// Capacities below the minimum of 3 are raised to it.
    #[must_use]
    pub fn new(recency: RecencyList, capacity: usize) -> Self {
        Self {
            recency,
            capacity: capacity.max(MIN_CAPACITY),
        }
    }

    /// Maximum number of ids that may retain files.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The recency order.
    #[must_use]
    pub fn recency(&self) -> &RecencyList {
        &self.recency
    }

    /// Record a successful request for `id`.
    pub fn touch(&mut self, id: ChartId) {
        self.recency.touch(id);
    }

    /// Enforce the capacity bound, then compact aliases among older ids.
    ///
    /// When the list exceeds capacity it shrinks to a third of capacity; the
    /// evicted ids lose their map entries and their files are reported as
    /// orphaned for the caller to delete. Ids for which `evictable` returns
    /// false are skipped and keep their place, so the list can stay above a
    /// third of capacity while such ids are busy.
    ///
    /// In the older half of what remains, light entries that alias the heavy
    /// package are dropped. The shared file still backs the heavy entry and
    /// is not deleted.
    pub fn reclaim(
        &mut self,
        maps: &mut VariantMaps,
        mut evictable: impl FnMut(ChartId) -> bool,
    ) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        if self.recency.len() > self.capacity {
            let keep = self.capacity / 3;
            let target = self.recency.len() - keep;
            for &id in self.recency.as_slice() {
                if report.evicted.len() == target {
                    break;
                }
                if evictable(id) {
                    report.evicted.push(id);
                } else {
                    debug!(%id, "Keeping busy id during reclaim");
                }
            }
            for &id in &report.evicted {
                self.recency.remove(id);
                let heavy = maps.remove(id, Variant::Heavy);
                let light = maps.remove(id, Variant::Light);
                if let Some(heavy) = heavy {
                    report.orphaned.push(heavy);
                }
                if let Some(light) = light.filter(|l| !report.orphaned.contains(l)) {
                    report.orphaned.push(light);
                }
            }
        }

        let older_half = self.recency.len() / 2;
        for &id in &self.recency.as_slice()[..older_half] {
            if maps.is_alias(id) {
                maps.remove(id, Variant::Light);
                report.unaliased.push(id);
            }
        }

        if !report.is_empty() {
            debug!(
                evicted = ?report.evicted,
                unaliased = ?report.unaliased,
                orphaned = report.orphaned.len(),
                remaining = self.recency.len(),
                "Reclaimed chart cache"
            );
        }
        report
    }
}

/// Delete a package file, returning its size if it was removed.
fn remove_package(path: &Path) -> Option<u64> {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(?path, "Evicted package");
            Some(size)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(?path, error = %e, "Failed to delete evicted package");
            None
        }
    }
}
