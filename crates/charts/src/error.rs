//! Error types for the chart cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::artifact::{ChartId, Variant};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Coarse classification of an origin failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// The origin denies that the chart exists.
    NotFound,
    /// Transport failure or timeout; re-issuing the request may succeed.
    Network,
    /// Anything else: unexpected status codes, truncated bodies.
    Other,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Network => write!(f, "network error"),
            Self::Other => write!(f, "origin error"),
        }
    }
}

/// Errors reported by an [`OriginFetcher`](crate::OriginFetcher).
#[derive(Error, Debug)]
pub enum FetchError {
    /// The origin has no package for this chart.
    #[error("chart {id} not found at origin")]
    NotFound {
        /// The requested chart.
        id: ChartId,
    },

    /// The request never produced a response.
    #[error("network error fetching chart {id}: {message}")]
    Network {
        /// The requested chart.
        id: ChartId,
        /// Transport error description.
        message: String,
    },

    /// The origin answered, but not with a usable package.
    #[error("unusable origin response for chart {id}: {message}")]
    Other {
        /// The requested chart.
        id: ChartId,
        /// What was wrong with the response.
        message: String,
    },
}

impl FetchError {
    /// Create a network error.
    #[must_use]
    pub fn network(id: ChartId, message: impl Into<String>) -> Self {
        Self::Network {
            id,
            message: message.into(),
        }
    }

    /// Create an unusable-response error.
    #[must_use]
    pub fn other(id: ChartId, message: impl Into<String>) -> Self {
        Self::Other {
            id,
            message: message.into(),
        }
    }

    /// The kind of failure.
    #[must_use]
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::NotFound { .. } => FetchErrorKind::NotFound,
            Self::Network { .. } => FetchErrorKind::Network,
            Self::Other { .. } => FetchErrorKind::Other,
        }
    }
}

/// Errors produced while building a light package from a heavy one.
///
/// A derivation error never leaves a file at the light path.
#[derive(Error, Debug)]
pub enum DerivationError {
    /// The package is not a readable zip archive.
    #[error("invalid package {}: {message}", path.display())]
    Archive {
        /// The package being read or written.
        path: PathBuf,
        /// Archive error description.
        message: String,
    },

    /// Filesystem failure while extracting or repackaging.
    #[error("I/O {operation} failed for {}: {source}", path.display())]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// Path that caused the error.
        path: PathBuf,
        /// Operation that failed (e.g., "extract", "persist").
        operation: String,
    },

    /// The heavy package's file name does not encode a chart id.
    #[error("{} is not a heavy chart package", path.display())]
    InvalidName {
        /// The offending path.
        path: PathBuf,
    },

    /// The blocking derivation task panicked or was cancelled.
    #[error("derivation task failed: {0}")]
    Task(String),
}

impl DerivationError {
    /// Create an archive error.
    #[must_use]
    pub fn archive(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    /// Create an I/O error with path context.
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: path.as_ref().to_path_buf(),
            operation: operation.into(),
        }
    }
}

/// Errors produced while refreshing the chart index.
#[derive(Error, Debug)]
pub enum OracleError {
    /// Every index URL failed.
    #[error("index request to {url} failed: {message}")]
    Request {
        /// The last URL tried.
        url: String,
        /// Error description.
        message: String,
    },

    /// The index body is not a JSON object.
    #[error("index is not a JSON object: {0}")]
    Parse(#[from] serde_json::Error),

    /// Reading or writing the local fallback copy failed.
    #[error("I/O {operation} failed for {}: {source}", path.display())]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// Path that caused the error.
        path: PathBuf,
        /// Operation that failed.
        operation: String,
    },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {}", path.display())]
    #[diagnostic(code(lyra::config::read))]
    Read {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// The configuration file.
        path: PathBuf,
    },

    /// The configuration file is not valid TOML for [`CacheConfig`](crate::CacheConfig).
    #[error("failed to parse config {}: {message}", path.display())]
    #[diagnostic(
        code(lyra::config::parse),
        help("Field names are camelCase, e.g. `cacheDir`, `requestTimeoutSecs`")
    )]
    Parse {
        /// The configuration file.
        path: PathBuf,
        /// Parser error description.
        message: String,
    },

    /// A value is out of range.
    #[error("invalid configuration: {message}")]
    #[diagnostic(code(lyra::config::invalid))]
    Invalid {
        /// What is wrong.
        message: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {message}")]
    #[diagnostic(code(lyra::config::http_client))]
    HttpClient {
        /// Error description.
        message: String,
    },
}

impl ConfigError {
    /// Create an invalid-value error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// A string that is not a positive chart id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid chart id '{0}': expected a positive integer")]
pub struct ParseChartIdError(pub String);

/// Errors returned by [`CacheManager`](crate::CacheManager).
#[derive(Error, Debug, Diagnostic)]
pub enum CacheError {
    /// The chart index is known and does not list this id. Never retried.
    #[error("chart {id} is not in the chart index")]
    #[diagnostic(
        code(lyra::cache::unknown_id),
        help("Check the chart id; the index lists every published chart")
    )]
    UnknownId {
        /// The rejected chart.
        id: ChartId,
    },

    /// The origin could not supply the package.
    #[error("failed to fetch {variant} package for chart {id} ({kind})")]
    #[diagnostic(code(lyra::cache::fetch))]
    FetchFailed {
        /// The requested chart.
        id: ChartId,
        /// The requested variant.
        variant: Variant,
        /// Failure classification.
        kind: FetchErrorKind,
        /// The origin error.
        #[source]
        source: FetchError,
    },

    /// The light package could be neither derived nor downloaded.
    #[error("failed to derive light package for chart {id}; download fallback failed: {fetch}")]
    #[diagnostic(code(lyra::cache::derivation))]
    DerivationFailed {
        /// The requested chart.
        id: ChartId,
        /// Why derivation failed.
        #[source]
        derivation: DerivationError,
        /// Why the download fallback failed.
        fetch: FetchError,
    },

    /// Disk failure on the write path.
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(lyra::cache::io),
        help("Check free disk space and permissions on the cache directory")
    )]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available.
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "write", "scan").
        operation: String,
    },

    /// Invalid configuration.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Create an I/O error with path context.
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// The origin failure kind, when the error came from a fetch.
    #[must_use]
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            Self::FetchFailed { kind, .. } => Some(*kind),
            Self::DerivationFailed { fetch, .. } => Some(fetch.kind()),
            _ => None,
        }
    }
}
