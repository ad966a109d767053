//! The chart cache front door.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactSource, ChartId, Variant};
use crate::config::CacheConfig;
use crate::derive::{Derived, VariantDeriver};
use crate::error::{CacheError, DerivationError, Result};
use crate::eviction::{EvictionPolicy, ReclaimReport, RecencyList};
use crate::flight::{FlightGuard, FlightLocks};
use crate::oracle::{IndexSource, ValidityOracle};
use crate::origin::OriginFetcher;
use crate::store::{self, ArtifactStore, VariantMaps, seed_recency};

/// Maps and recency order, always updated together.
#[derive(Debug)]
struct CacheState {
    maps: VariantMaps,
    eviction: EvictionPolicy,
    /// Bumped on every recency change; orders persisted snapshots.
    generation: u64,
}

/// Point-in-time summary of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Ids in the chart index; zero when the index is unavailable.
    pub known_ids: usize,
    /// Ids in the recency list.
    pub tracked_ids: usize,
    /// Maximum number of tracked ids.
    pub capacity: usize,
    /// Heavy packages registered.
    pub heavy: usize,
    /// Light packages registered, aliases included.
    pub light: usize,
    /// Light entries that alias the heavy package.
    pub aliased: usize,
}

/// Bounded, disk-backed cache of chart packages.
///
/// Shared behind an `Arc`; every method takes `&self`. Requests for the same
/// id are serialized, so concurrent misses trigger a single download or
/// derivation and later callers see a cache hit.
pub struct CacheManager {
    store: ArtifactStore,
    deriver: VariantDeriver,
    origin: Arc<dyn OriginFetcher>,
    index_source: Option<Arc<dyn IndexSource>>,
    oracle: RwLock<ValidityOracle>,
    state: Mutex<CacheState>,
    flights: FlightLocks<ChartId>,
    /// Generation of the last recency snapshot written to disk.
    persisted: Arc<StdMutex<u64>>,
}

impl CacheManager {
    /// Open the cache: refresh the chart index, scan the cache directory,
    /// restore the recency order and reclaim down to capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the cache
    /// directory cannot be created or scanned. Index failures are not errors.
    pub async fn open(
        config: &CacheConfig,
        index_source: Arc<dyn IndexSource>,
        origin: Arc<dyn OriginFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ArtifactStore::new(&config.cache_dir);
        store.ensure_dir()?;
        let oracle = ValidityOracle::refresh(index_source.as_ref(), &store.index_path()).await;

        let mut manager = Self::assemble(config, store, oracle, origin)?;
        manager.index_source = Some(index_source);
        Ok(manager)
    }

    /// Build a cache around an already loaded oracle.
    ///
    /// [`refresh_index`](Self::refresh_index) is a no-op on such a cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the cache
    /// directory cannot be created or scanned.
    pub fn from_parts(
        config: &CacheConfig,
        oracle: ValidityOracle,
        origin: Arc<dyn OriginFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, ArtifactStore::new(&config.cache_dir), oracle, origin)
    }

    fn assemble(
        config: &CacheConfig,
        store: ArtifactStore,
        oracle: ValidityOracle,
        origin: Arc<dyn OriginFetcher>,
    ) -> Result<Self> {
        let scan = store.scan()?;
        let hint = store.load_recency_hint();
        let recency = RecencyList::from_ids(seed_recency(&hint, &scan));
        let mut eviction = EvictionPolicy::new(recency, config.capacity);
        let mut maps = scan.maps;

        let report = eviction.reclaim(&mut maps, |_| true);
        let removed = report.remove_orphaned();
        if let Err(e) = store.save_recency_hint(eviction.recency().as_slice()) {
            warn!(error = %e, "Failed to persist recency order");
        }

        info!(
            root = ?store.root(),
            tracked = eviction.recency().len(),
            capacity = eviction.capacity(),
            evicted = report.evicted.len(),
            bytes_freed = removed.bytes,
            stale_removed = scan.stale_removed,
            known_ids = oracle.len(),
            "Opened chart cache"
        );

        Ok(Self {
            store,
            deriver: VariantDeriver::from_config(config),
            origin,
            index_source: None,
            oracle: RwLock::new(oracle),
            state: Mutex::new(CacheState {
                maps,
                eviction,
                generation: 0,
            }),
            flights: FlightLocks::new(),
            persisted: Arc::new(StdMutex::new(0)),
        })
    }

    /// Return a cached package for `id`, deriving or downloading it if needed.
    ///
    /// A light request is served, in order, from the light entry, by deriving
    /// from a cached heavy package, or by downloading the light package. Only
    /// successful requests count as a use for eviction.
    ///
    /// # Errors
    ///
    /// - [`CacheError::UnknownId`] if the chart index is loaded and lacks `id`
    /// - [`CacheError::FetchFailed`] if the origin cannot supply the package
    /// - [`CacheError::DerivationFailed`] if derivation and the download
    ///   fallback both failed
    /// - [`CacheError::Io`] if the package cannot be written, or vanishes
    ///   before it is recorded
    pub async fn get_artifact(&self, id: ChartId, variant: Variant) -> Result<Artifact> {
        if !self.oracle.read().await.is_known(id) {
            debug!(%id, "Rejecting id missing from chart index");
            return Err(CacheError::UnknownId { id });
        }

        let _flight = self.flights.acquire(id).await;

        if let Some(path) = self.lookup(id, variant).await {
            if let Some(artifact) = self.commit(id, variant, path, ArtifactSource::Hit).await {
                return Ok(artifact);
            }
        }

        let mut derivation_error = None;
        if variant.is_light() {
            if let Some(heavy) = self.lookup(id, Variant::Heavy).await {
                match self.derive(heavy).await {
                    Ok(derived) => {
                        let path = derived.into_path();
                        return self
                            .commit(id, variant, path.clone(), ArtifactSource::Derived)
                            .await
                            .ok_or_else(|| vanished(&path));
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "Light derivation failed; downloading instead");
                        derivation_error = Some(e);
                    }
                }
            }
        }

        let bytes = match self.origin.fetch(id, variant).await {
            Ok(bytes) => bytes,
            Err(fetch) => {
                warn!(%id, %variant, error = %fetch, "Origin fetch failed");
                return Err(match derivation_error {
                    Some(derivation) => CacheError::DerivationFailed {
                        id,
                        derivation,
                        fetch,
                    },
                    None => CacheError::FetchFailed {
                        id,
                        variant,
                        kind: fetch.kind(),
                        source: fetch,
                    },
                });
            }
        };

        let path = self.store.path_for(id, variant);
        write_package(path.clone(), bytes).await?;
        self.commit(id, variant, path.clone(), ArtifactSource::Downloaded)
            .await
            .ok_or_else(|| vanished(&path))
    }

    /// Registered path for `id`, dropping the entry if its file is gone.
    async fn lookup(&self, id: ChartId, variant: Variant) -> Option<PathBuf> {
        let mut state = self.state.lock().await;
        let path = state.maps.get(id, variant)?.clone();
        if path.is_file() {
            return Some(path);
        }
        warn!(%id, %variant, ?path, "Cached package vanished; dropping entry");
        state.maps.remove(id, variant);
        None
    }

    async fn derive(&self, heavy: PathBuf) -> std::result::Result<Derived, DerivationError> {
        let deriver = self.deriver.clone();
        tokio::task::spawn_blocking(move || deriver.derive(&heavy))
            .await
            .map_err(|e| DerivationError::Task(e.to_string()))?
    }

    /// Record a successful request for `id`, which the caller holds in flight.
    ///
    /// Registration, touch and reclaim happen in one critical section, and
    /// only if `path` still exists. Ids held by other requests are never
    /// evicted. Evicted ids stay held until their files are deleted, then
    /// the recency order is persisted. Returns `None` if the file is gone.
    async fn commit(
        &self,
        id: ChartId,
        variant: Variant,
        path: PathBuf,
        source: ArtifactSource,
    ) -> Option<Artifact> {
        let mut state = self.state.lock().await;
        let CacheState {
            maps,
            eviction,
            generation,
        } = &mut *state;
        if !path.is_file() {
            warn!(%id, %variant, ?path, "Package vanished before it could be recorded");
            if maps.get(id, variant) == Some(&path) {
                maps.remove(id, variant);
            }
            return None;
        }
        maps.insert(id, variant, path.clone());
        eviction.touch(id);

        let mut held = Vec::new();
        let report = eviction.reclaim(maps, |candidate| {
            self.flights.try_acquire(candidate).is_some_and(|guard| {
                held.push(guard);
                true
            })
        });
        *generation += 1;
        let snapshot = (*generation, eviction.recency().as_slice().to_vec());
        drop(state);

        if !report.orphaned.is_empty() {
            remove_orphaned(report, held).await;
        }
        self.persist_recency(snapshot).await;

        match source {
            ArtifactSource::Hit => debug!(%id, %variant, ?path, "Cache hit"),
            _ => info!(%id, %variant, %source, ?path, "Cached package"),
        }
        Some(Artifact {
            id,
            variant,
            path,
            source,
        })
    }

    /// Write a recency snapshot unless a newer one was already written.
    async fn persist_recency(&self, (generation, order): (u64, Vec<ChartId>)) {
        let store = self.store.clone();
        let persisted = Arc::clone(&self.persisted);
        let written = tokio::task::spawn_blocking(move || {
            let mut last = persisted.lock().unwrap_or_else(PoisonError::into_inner);
            if generation <= *last {
                return Ok(());
            }
            store.save_recency_hint(&order)?;
            *last = generation;
            Ok::<_, CacheError>(())
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist recency order"),
            Err(e) => warn!(error = %e, "Recency persistence task failed"),
        }
    }

    /// Whether `id` passes the chart index gate.
    pub async fn is_known(&self, id: ChartId) -> bool {
        self.oracle.read().await.is_known(id)
    }

    /// Re-fetch the chart index and swap it in.
    ///
    /// Returns the number of known ids afterwards.
    pub async fn refresh_index(&self) -> usize {
        let Some(source) = &self.index_source else {
            debug!("No index source configured; keeping current index");
            return self.oracle.read().await.len();
        };
        let oracle = ValidityOracle::refresh(source.as_ref(), &self.store.index_path()).await;
        let known = oracle.len();
        *self.oracle.write().await = oracle;
        known
    }

    /// The recency order, least recent first.
    pub async fn recency(&self) -> Vec<ChartId> {
        self.state.lock().await.eviction.recency().as_slice().to_vec()
    }

    /// Registered path for a package, without counting as a use.
    pub async fn cached_path(&self, id: ChartId, variant: Variant) -> Option<PathBuf> {
        self.state.lock().await.maps.get(id, variant).cloned()
    }

    /// Ids with a registered package of the given variant, ascending.
    pub async fn cached_ids(&self, variant: Variant) -> Vec<ChartId> {
        let state = self.state.lock().await;
        let map = match variant {
            Variant::Heavy => &state.maps.heavy,
            Variant::Light => &state.maps.light,
        };
        let mut ids: Vec<ChartId> = map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Summary counts.
    pub async fn stats(&self) -> CacheStats {
        let known_ids = self.oracle.read().await.len();
        let state = self.state.lock().await;
        CacheStats {
            known_ids,
            tracked_ids: state.eviction.recency().len(),
            capacity: state.eviction.capacity(),
            heavy: state.maps.heavy.len(),
            light: state.maps.light.len(),
            aliased: state.maps.alias_count(),
        }
    }

    /// The cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        self.store.root()
    }
}

/// Delete evicted packages on the blocking pool, holding their ids until done.
async fn remove_orphaned(report: ReclaimReport, held: Vec<FlightGuard<ChartId>>) {
    let removal = tokio::task::spawn_blocking(move || {
        let removed = report.remove_orphaned();
        drop(held);
        removed
    })
    .await;
    if let Err(e) = removal {
        warn!(error = %e, "Package deletion task failed");
    }
}

fn vanished(path: &Path) -> CacheError {
    CacheError::io(
        std::io::Error::from(std::io::ErrorKind::NotFound),
        path,
        "record",
    )
}

/// Write downloaded bytes to their canonical path on the blocking pool.
async fn write_package(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        store::write_atomic(&path, &bytes).map_err(|e| CacheError::io(e, &path, "write"))
    })
    .await
    .map_err(|e| CacheError::Io {
        source: std::io::Error::other(e),
        path: None,
        operation: "write task".to_string(),
    })?
}
