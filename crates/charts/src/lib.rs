//! Bounded, disk-backed cache of chart packages
//!
//! Chart packages are zip archives addressed by a numeric id. Each id has two
//! forms:
//! - Heavy: the full package, which may embed a background video
//! - Light: the same package without video
//!
//! # Overview
//!
//! [`CacheManager::get_artifact`] is the single entry point. A request is
//! checked against the chart index ([`ValidityOracle`]), then served from
//! disk ([`ArtifactStore`]), by deriving a light package from a cached heavy
//! one ([`VariantDeriver`]), or by downloading from the origin
//! ([`OriginFetcher`]). Successful requests feed an LRU policy
//! ([`EvictionPolicy`]) that keeps the number of cached ids bounded.
//!
//! # Light packages
//!
//! When a heavy package has no video, the light request is served by the
//! heavy file itself and no second file is written. Older ids lose these
//! aliases first; the heavy package stays until the id is evicted.

mod artifact;
mod config;
mod derive;
mod error;
mod eviction;
mod flight;
mod manager;
mod oracle;
mod origin;
pub mod package;
mod store;

pub use artifact::{
    Artifact, ArtifactSource, ChartId, HEAVY_SUFFIX, LIGHT_SUFFIX, Variant, artifact_file_name,
    parse_artifact_file_name,
};
pub use config::{CACHE_DIR_ENV, CacheConfig, DEFAULT_CAPACITY, MIN_CAPACITY};
pub use derive::{Derived, VariantDeriver};
pub use error::{
    CacheError, ConfigError, DerivationError, FetchError, FetchErrorKind, OracleError,
    ParseChartIdError, Result,
};
pub use eviction::{EvictionPolicy, ReclaimReport, RecencyList, RemovedFiles};
pub use flight::{FlightGuard, FlightLocks};
pub use manager::{CacheManager, CacheStats};
pub use oracle::{HttpIndexSource, IndexSource, ValidityOracle};
pub use origin::{HttpOriginFetcher, OriginFetcher};
pub use store::{
    ArtifactStore, INDEX_FILE, RECENCY_FILE, ScanResult, VariantMaps, seed_recency, write_atomic,
};
