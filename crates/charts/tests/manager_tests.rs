//! End-to-end behaviour of `CacheManager` against in-memory collaborators.

use async_trait::async_trait;
use lyra_charts::{
    ArtifactSource, ArtifactStore, CacheConfig, CacheError, CacheManager, ChartId, FetchError,
    FetchErrorKind, IndexSource, OracleError, OriginFetcher, ValidityOracle, Variant, package,
};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

fn id(raw: u32) -> ChartId {
    ChartId::new(raw).unwrap()
}

fn package_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn plain_package(title: &str) -> Vec<u8> {
    package_bytes(&[
        ("maidata.txt", format!("&title={title}\n").as_bytes()),
        ("track.mp3", b"audio"),
        ("bg.png", b"image"),
    ])
}

fn video_package(title: &str) -> Vec<u8> {
    package_bytes(&[
        ("maidata.txt", format!("&title={title}\n").as_bytes()),
        ("track.mp3", b"audio"),
        ("bg.png", b"image"),
        ("pv.mp4", b"large video payload"),
    ])
}

/// Origin serving a fixed set of packages and counting requests.
#[derive(Default)]
struct FakeOrigin {
    packages: HashMap<(ChartId, Variant), Vec<u8>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    failure: Option<FetchErrorKind>,
}

impl FakeOrigin {
    fn with(mut self, raw: u32, variant: Variant, bytes: Vec<u8>) -> Self {
        self.packages.insert((id(raw), variant), bytes);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetcher for FakeOrigin {
    async fn fetch(&self, id: ChartId, variant: Variant) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.failure {
            Some(FetchErrorKind::Network) => return Err(FetchError::network(id, "connection reset")),
            Some(FetchErrorKind::Other) => return Err(FetchError::other(id, "HTTP 500")),
            Some(FetchErrorKind::NotFound) | None => {}
        }
        self.packages
            .get(&(id, variant))
            .cloned()
            .ok_or(FetchError::NotFound { id })
    }
}

struct FakeIndex(Option<&'static str>);

#[async_trait]
impl IndexSource for FakeIndex {
    async fn fetch_index(&self) -> Result<Vec<u8>, OracleError> {
        self.0
            .map(|body| body.as_bytes().to_vec())
            .ok_or_else(|| OracleError::Request {
                url: "https://index.example/index.json".to_string(),
                message: "offline".to_string(),
            })
    }
}

fn config(dir: &Path, capacity: usize) -> CacheConfig {
    CacheConfig {
        capacity,
        ..CacheConfig::with_cache_dir(dir)
    }
}

fn cache(dir: &Path, oracle: ValidityOracle, origin: Arc<FakeOrigin>) -> CacheManager {
    CacheManager::from_parts(&config(dir, 39), oracle, origin).unwrap()
}

fn package_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".zip"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn unknown_id_is_rejected_without_side_effects() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(5, Variant::Heavy, plain_package("A")));
    let cache = cache(
        temp.path(),
        ValidityOracle::from_ids([id(100)]),
        Arc::clone(&origin),
    );

    let err = cache.get_artifact(id(5), Variant::Heavy).await.unwrap_err();

    assert!(matches!(err, CacheError::UnknownId { id } if id.get() == 5));
    assert_eq!(origin.calls(), 0);
    assert!(cache.recency().await.is_empty());
    assert!(package_files(temp.path()).is_empty());
}

#[tokio::test]
async fn empty_index_is_fail_open_and_reports_not_found() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default());
    let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    let err = cache
        .get_artifact(id(999_999), Variant::Heavy)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CacheError::FetchFailed {
            kind: FetchErrorKind::NotFound,
            ..
        }
    ));
    assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NotFound));
    assert_eq!(origin.calls(), 1);
    assert!(cache.recency().await.is_empty());
}

#[tokio::test]
async fn network_failure_is_classified() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin {
        failure: Some(FetchErrorKind::Network),
        ..FakeOrigin::default()
    });
    let cache = cache(temp.path(), ValidityOracle::empty(), origin);

    let err = cache.get_artifact(id(1), Variant::Light).await.unwrap_err();

    assert_eq!(err.fetch_kind(), Some(FetchErrorKind::Network));
    assert!(package_files(temp.path()).is_empty());
}

#[tokio::test]
async fn package_without_video_serves_both_variants_from_one_file() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(11, Variant::Heavy, plain_package("Plain")));
    let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    let heavy = cache.get_artifact(id(11), Variant::Heavy).await.unwrap();
    let light = cache.get_artifact(id(11), Variant::Light).await.unwrap();

    assert_eq!(heavy.source, ArtifactSource::Downloaded);
    assert_eq!(light.source, ArtifactSource::Derived);
    assert_eq!(heavy.path, light.path);
    assert_eq!(package_files(temp.path()), vec!["11.zip"]);
    assert_eq!(origin.calls(), 1);
    assert_eq!(cache.stats().await.aliased, 1);
}

#[tokio::test]
async fn video_package_is_stripped_then_hit() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(100, Variant::Heavy, video_package("Video")));
    let cache = cache(
        temp.path(),
        ValidityOracle::from_ids([id(100)]),
        Arc::clone(&origin),
    );

    let heavy = cache.get_artifact(id(100), Variant::Heavy).await.unwrap();
    let light = cache.get_artifact(id(100), Variant::Light).await.unwrap();
    let again = cache.get_artifact(id(100), Variant::Light).await.unwrap();

    assert_eq!(heavy.source, ArtifactSource::Downloaded);
    assert_eq!(light.source, ArtifactSource::Derived);
    assert_eq!(again.source, ArtifactSource::Hit);
    assert_ne!(heavy.path, light.path);
    assert_eq!(light.path, again.path);
    assert_eq!(origin.calls(), 1);

    let light_entries = package::entry_names(&light.path).unwrap();
    assert_eq!(light_entries, vec!["maidata.txt", "track.mp3", "bg.png"]);
    assert!(
        package::entry_names(&heavy.path)
            .unwrap()
            .contains(&"pv.mp4".to_string())
    );
    assert_eq!(
        package::read_title(&light.path).unwrap(),
        Some("Video".to_string())
    );
    assert_eq!(package_files(temp.path()), vec!["100.nobga.zip", "100.zip"]);
}

#[tokio::test]
async fn light_without_heavy_downloads_light_package() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(
        8,
        Variant::Light,
        plain_package("Light only"),
    ));
    let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    let light = cache.get_artifact(id(8), Variant::Light).await.unwrap();

    assert_eq!(light.source, ArtifactSource::Downloaded);
    assert_eq!(light.path, temp.path().join("8.nobga.zip"));
    assert_eq!(cache.cached_path(id(8), Variant::Heavy).await, None);
}

#[tokio::test]
async fn repeated_requests_fetch_once() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(3, Variant::Heavy, plain_package("A")));
    let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    let first = cache.get_artifact(id(3), Variant::Heavy).await.unwrap();
    for _ in 0..5 {
        let next = cache.get_artifact(id(3), Variant::Heavy).await.unwrap();
        assert_eq!(next.source, ArtifactSource::Hit);
        assert_eq!(next.path, first.path);
    }
    assert_eq!(origin.calls(), 1);
    assert_eq!(cache.recency().await, vec![id(3)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_misses_fetch_once() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin {
        delay: Some(Duration::from_millis(50)),
        ..FakeOrigin::default().with(21, Variant::Heavy, video_package("Busy"))
    });
    let cache = Arc::new(cache(
        temp.path(),
        ValidityOracle::empty(),
        Arc::clone(&origin),
    ));

    let requests = (0..8).map(|_| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get_artifact(id(21), Variant::Heavy).await })
    });
    let results: Vec<_> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(origin.calls(), 1);
    let downloaded = results
        .iter()
        .filter(|a| a.source == ArtifactSource::Downloaded)
        .count();
    assert_eq!(downloaded, 1);
    assert!(results.iter().all(|a| a.path == results[0].path));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_light_requests_derive_once() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(22, Variant::Heavy, video_package("Busy")));
    let cache = Arc::new(cache(
        temp.path(),
        ValidityOracle::empty(),
        Arc::clone(&origin),
    ));
    cache.get_artifact(id(22), Variant::Heavy).await.unwrap();

    let results = futures::future::join_all(
        (0..6).map(|_| cache.get_artifact(id(22), Variant::Light)),
    )
    .await;

    let sources: Vec<ArtifactSource> = results.into_iter().map(|r| r.unwrap().source).collect();
    assert_eq!(
        sources
            .iter()
            .filter(|s| **s == ArtifactSource::Derived)
            .count(),
        1
    );
    assert_eq!(origin.calls(), 1);
}

/// Every map entry names an existing file, and every package on disk is
/// registered.
async fn assert_consistent(cache: &CacheManager, dir: &Path) {
    let mut registered = Vec::new();
    for variant in [Variant::Heavy, Variant::Light] {
        for chart in cache.cached_ids(variant).await {
            let path = cache.cached_path(chart, variant).await.unwrap();
            assert!(path.is_file(), "{chart} {variant} points at missing {path:?}");
            registered.push(path.file_name().unwrap().to_string_lossy().into_owned());
        }
    }
    registered.sort();
    registered.dedup();
    assert_eq!(package_files(dir), registered);

    let recency = cache.recency().await;
    for chart in &recency {
        let heavy = cache.cached_path(*chart, Variant::Heavy).await;
        let light = cache.cached_path(*chart, Variant::Light).await;
        assert!(heavy.is_some() || light.is_some(), "{chart} tracked without files");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reclaim_for_another_id_spares_requests_in_flight() {
    for _ in 0..50 {
        let temp = TempDir::new().unwrap();
        let mut origin = FakeOrigin::default();
        for raw in 1..=4 {
            origin = origin
                .with(raw, Variant::Heavy, plain_package("A"))
                .with(raw, Variant::Light, plain_package("A"));
        }
        let cache = Arc::new(
            CacheManager::from_parts(
                &config(temp.path(), 3),
                ValidityOracle::empty(),
                Arc::new(origin),
            )
            .unwrap(),
        );
        for raw in 1..=3 {
            cache.get_artifact(id(raw), Variant::Heavy).await.unwrap();
        }

        // Deriving 1 races with 4 pushing the list over capacity.
        let light = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_artifact(id(1), Variant::Light).await })
        };
        let heavy = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_artifact(id(4), Variant::Heavy).await })
        };
        let light = light.await.unwrap().unwrap();
        let heavy = heavy.await.unwrap().unwrap();

        let recency = cache.recency().await;
        for artifact in [&light, &heavy] {
            // A later reclaim may evict an id once its request has returned.
            if recency.contains(&artifact.id) {
                assert!(
                    artifact.path.is_file(),
                    "{} returned missing {:?}; recency {recency:?}",
                    artifact.id,
                    artifact.path
                );
            }
        }
        assert!(recency.contains(&id(4)));
        assert_consistent(&cache, temp.path()).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_many_ids_stay_consistent() {
    let temp = TempDir::new().unwrap();
    let mut origin = FakeOrigin {
        delay: Some(Duration::from_millis(2)),
        ..FakeOrigin::default()
    };
    for raw in 1..=13 {
        let heavy = if raw % 2 == 0 {
            video_package("Even")
        } else {
            plain_package("Odd")
        };
        origin = origin
            .with(raw, Variant::Heavy, heavy)
            .with(raw, Variant::Light, plain_package("Light"));
    }
    let cache = Arc::new(
        CacheManager::from_parts(
            &config(temp.path(), 4),
            ValidityOracle::empty(),
            Arc::new(origin),
        )
        .unwrap(),
    );

    let requests = (0..60u32).map(|n| {
        let cache = Arc::clone(&cache);
        let chart = id(n % 12 + 1);
        let variant = if n % 3 == 0 {
            Variant::Heavy
        } else {
            Variant::Light
        };
        tokio::spawn(async move { cache.get_artifact(chart, variant).await })
    });
    for joined in futures::future::join_all(requests).await {
        let artifact = joined.unwrap().unwrap();
        // Paths may have been evicted since; the registered one must exist.
        if let Some(path) = cache.cached_path(artifact.id, artifact.variant).await {
            assert!(path.is_file(), "missing {path:?}");
        }
    }
    assert_consistent(&cache, temp.path()).await;

    // With nothing in flight the bound holds again.
    cache.get_artifact(id(13), Variant::Heavy).await.unwrap();
    assert!(cache.recency().await.len() <= 4);
    assert_consistent(&cache, temp.path()).await;

    // The newest order wins even though hint writes happen outside the lock.
    assert_eq!(
        ArtifactStore::new(temp.path()).load_recency_hint(),
        cache.recency().await
    );
}

#[tokio::test]
async fn exceeding_capacity_evicts_least_recent() {
    let temp = TempDir::new().unwrap();
    let mut origin = FakeOrigin::default();
    for raw in 1..=7 {
        origin = origin.with(raw, Variant::Heavy, plain_package("A"));
    }
    let origin = Arc::new(origin);
    let capacity = 6;
    let cache =
        CacheManager::from_parts(&config(temp.path(), capacity), ValidityOracle::empty(), origin)
            .unwrap();

    for raw in 1..=7 {
        cache.get_artifact(id(raw), Variant::Heavy).await.unwrap();
    }

    let recency = cache.recency().await;
    assert!(recency.len() <= capacity);
    // 7 > 6, so the list shrinks to floor(6 / 3) = 2.
    assert_eq!(recency, vec![id(6), id(7)]);
    assert_eq!(package_files(temp.path()), vec!["6.zip", "7.zip"]);
    assert!(cache.cached_path(id(1), Variant::Heavy).await.is_none());
    assert!(temp.path().join("7.zip").exists());
}

#[tokio::test]
async fn evicted_id_is_fetched_again() {
    let temp = TempDir::new().unwrap();
    let mut origin = FakeOrigin::default();
    for raw in 1..=4 {
        origin = origin.with(raw, Variant::Heavy, plain_package("A"));
    }
    let origin = Arc::new(origin);
    let cache = CacheManager::from_parts(
        &config(temp.path(), 3),
        ValidityOracle::empty(),
        Arc::clone(&origin) as Arc<dyn OriginFetcher>,
    )
    .unwrap();

    for raw in 1..=4 {
        cache.get_artifact(id(raw), Variant::Heavy).await.unwrap();
    }
    let again = cache.get_artifact(id(1), Variant::Heavy).await.unwrap();

    assert_eq!(again.source, ArtifactSource::Downloaded);
    assert_eq!(origin.calls(), 5);
}

#[tokio::test]
async fn older_aliases_are_compacted_but_heavy_kept() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(
        FakeOrigin::default()
            .with(1, Variant::Heavy, plain_package("Old"))
            .with(2, Variant::Heavy, plain_package("Newer"))
            .with(3, Variant::Heavy, plain_package("Newest")),
    );
    let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    let light = cache.get_artifact(id(1), Variant::Light).await;
    // Light is not cached and there is no heavy package yet: the light
    // download is missing at the origin.
    assert!(light.is_err());

    let heavy = cache.get_artifact(id(1), Variant::Heavy).await.unwrap();
    let light = cache.get_artifact(id(1), Variant::Light).await.unwrap();
    assert_eq!(light.path, heavy.path);
    cache.get_artifact(id(2), Variant::Heavy).await.unwrap();
    cache.get_artifact(id(3), Variant::Heavy).await.unwrap();

    // Recency is [1, 2, 3]; the older half is [1].
    assert_eq!(cache.cached_path(id(1), Variant::Light).await, None);
    assert_eq!(
        cache.cached_path(id(1), Variant::Heavy).await,
        Some(heavy.path.clone())
    );
    assert!(heavy.path.exists());

    // Asking again re-creates the alias without a download.
    let calls = origin.calls();
    let light = cache.get_artifact(id(1), Variant::Light).await.unwrap();
    assert_eq!(light.source, ArtifactSource::Derived);
    assert_eq!(light.path, heavy.path);
    assert_eq!(origin.calls(), calls);
}

#[tokio::test]
async fn corrupt_heavy_falls_back_to_light_download() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("9.zip"), b"not a zip archive").unwrap();
    let origin = Arc::new(FakeOrigin::default().with(9, Variant::Light, plain_package("Fixed")));
    let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    let light = cache.get_artifact(id(9), Variant::Light).await.unwrap();

    assert_eq!(light.source, ArtifactSource::Downloaded);
    assert_eq!(light.path, temp.path().join("9.nobga.zip"));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test]
async fn failed_derivation_and_download_report_both() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("9.zip"), b"not a zip archive").unwrap();
    let cache = cache(
        temp.path(),
        ValidityOracle::empty(),
        Arc::new(FakeOrigin::default()),
    );

    let err = cache.get_artifact(id(9), Variant::Light).await.unwrap_err();

    assert!(matches!(err, CacheError::DerivationFailed { .. }));
    assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NotFound));
    assert!(!temp.path().join("9.nobga.zip").exists());
    // Only the startup scan put 9 in the recency list.
    assert_eq!(cache.recency().await, vec![id(9)]);
}

#[tokio::test]
async fn recency_survives_restart() {
    let temp = TempDir::new().unwrap();
    let mut origin = FakeOrigin::default();
    for raw in 1..=3 {
        origin = origin.with(raw, Variant::Heavy, plain_package("A"));
    }
    let origin = Arc::new(origin);
    {
        let cache = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));
        for raw in [1, 2, 3, 1] {
            cache.get_artifact(id(raw), Variant::Heavy).await.unwrap();
        }
        assert_eq!(cache.recency().await, vec![id(2), id(3), id(1)]);
    }

    let reopened = cache(temp.path(), ValidityOracle::empty(), Arc::clone(&origin));

    assert_eq!(reopened.recency().await, vec![id(2), id(3), id(1)]);
    let hit = reopened.get_artifact(id(2), Variant::Heavy).await.unwrap();
    assert_eq!(hit.source, ArtifactSource::Hit);
    assert_eq!(origin.calls(), 3);
}

#[tokio::test]
async fn startup_reclaims_over_capacity_directory() {
    let temp = TempDir::new().unwrap();
    for raw in 1..=5u64 {
        let path = temp.path().join(format!("{raw}.zip"));
        std::fs::write(&path, plain_package("A")).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 * raw))
            .unwrap();
    }

    let cache = CacheManager::from_parts(
        &config(temp.path(), 3),
        ValidityOracle::empty(),
        Arc::new(FakeOrigin::default()),
    )
    .unwrap();

    // Discovered oldest first by modification time; 5 > 3 keeps one.
    assert_eq!(cache.recency().await, vec![id(5)]);
    assert_eq!(package_files(temp.path()), vec!["5.zip"]);
}

#[tokio::test]
async fn open_persists_index_and_gates_requests() {
    let temp = TempDir::new().unwrap();
    let origin = Arc::new(FakeOrigin::default().with(42, Variant::Heavy, plain_package("A")));
    let config = config(temp.path(), 39);

    let cache = CacheManager::open(
        &config,
        Arc::new(FakeIndex(Some(r#"{"42": {"title": "A"}}"#))),
        Arc::clone(&origin) as Arc<dyn OriginFetcher>,
    )
    .await
    .unwrap();

    assert!(temp.path().join("index.json").exists());
    assert!(cache.get_artifact(id(42), Variant::Heavy).await.is_ok());
    assert!(matches!(
        cache.get_artifact(id(43), Variant::Heavy).await,
        Err(CacheError::UnknownId { .. })
    ));
    assert_eq!(cache.refresh_index().await, 1);

    // Offline restart uses the saved copy.
    drop(cache);
    let offline = CacheManager::open(&config, Arc::new(FakeIndex(None)), origin)
        .await
        .unwrap();
    assert!(!offline.is_known(id(43)).await);
    assert_eq!(offline.stats().await.known_ids, 1);
}

#[tokio::test]
async fn interrupted_writes_are_cleaned_on_open() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join(".12.zip.aB3dEf.tmp"), b"partial").unwrap();
    std::fs::create_dir(temp.path().join(".derive-XyZ123")).unwrap();

    let cache = cache(
        temp.path(),
        ValidityOracle::empty(),
        Arc::new(FakeOrigin::default()),
    );

    assert!(cache.recency().await.is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}
