//! Subcommand implementations. Each returns the text to print.

use lyra_charts::{
    ArtifactStore, CacheConfig, CacheError, CacheManager, ChartId, HttpIndexSource,
    HttpOriginFetcher, ValidityOracle, Variant, package, seed_recency,
};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::warn;

use crate::cli::Commands;

/// Run a subcommand against the configured cache.
pub async fn run(command: Commands, config: &CacheConfig) -> Result<String, CacheError> {
    match command {
        Commands::Get { id, light } => {
            let manager = CacheManager::open(
                config,
                Arc::new(HttpIndexSource::new(config)?),
                Arc::new(HttpOriginFetcher::new(config)?),
            )
            .await?;
            get(&manager, id, light).await
        }
        Commands::Scan => scan(&ArtifactStore::new(&config.cache_dir), config.capacity),
        Commands::RefreshIndex => {
            let store = ArtifactStore::new(&config.cache_dir);
            store.ensure_dir()?;
            let source = HttpIndexSource::new(config)?;
            let oracle = ValidityOracle::refresh(&source, &store.index_path()).await;
            Ok(refresh_summary(&oracle))
        }
    }
}

/// Fetch one package and describe it.
pub async fn get(manager: &CacheManager, id: ChartId, light: bool) -> Result<String, CacheError> {
    let artifact = manager
        .get_artifact(id, Variant::from_light_flag(light))
        .await?;

    let mut out = format!(
        "{} ({}, {})\npath: {}",
        artifact.id,
        artifact.variant,
        artifact.source,
        artifact.path.display()
    );
    match package::read_title(&artifact.path) {
        Ok(Some(title)) => {
            let _ = write!(out, "\ntitle: {title}");
        }
        Ok(None) => {}
        Err(e) => warn!(%id, error = %e, "Could not read chart title"),
    }
    Ok(out)
}

/// Describe the cache contents as found on disk.
///
/// Lists packages without enforcing capacity: nothing is evicted and the
/// recency hint is left as it is. Leftover temporary files are removed.
pub fn scan(store: &ArtifactStore, capacity: usize) -> Result<String, CacheError> {
    let scanned = store.scan()?;
    let recency = seed_recency(&store.load_recency_hint(), &scanned);
    let heavy = sorted_ids(scanned.maps.heavy.keys());
    let light = sorted_ids(scanned.maps.light.keys());

    let mut out = format!("cache: {}\n", store.root().display());
    let _ = writeln!(out, "heavy ({}): {}", heavy.len(), join(&heavy));
    let _ = writeln!(
        out,
        "light ({}, {} aliased): {}",
        light.len(),
        scanned.maps.alias_count(),
        join(&light)
    );
    let _ = write!(
        out,
        "recency ({}/{}, oldest first): {}",
        recency.len(),
        capacity,
        join(&recency)
    );
    Ok(out)
}

fn sorted_ids<'a>(ids: impl Iterator<Item = &'a ChartId>) -> Vec<ChartId> {
    let mut ids: Vec<ChartId> = ids.copied().collect();
    ids.sort_unstable();
    ids
}

fn refresh_summary(oracle: &ValidityOracle) -> String {
    if oracle.is_empty() {
        "chart index unavailable; every id is accepted".to_string()
    } else {
        format!("chart index lists {} charts", oracle.len())
    }
}

fn join(ids: &[ChartId]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
