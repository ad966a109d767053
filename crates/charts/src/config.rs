//! Configuration for the chart cache
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable that overrides `cacheDir`.
pub const CACHE_DIR_ENV: &str = "LYRA_CACHE_DIR";

/// Number of distinct ids that may keep cached files.
pub const DEFAULT_CAPACITY: usize = 39;

/// Smallest capacity for which the reclaim pass keeps at least one id.
pub const MIN_CAPACITY: usize = 3;

const DEFAULT_INDEX_URL: &str =
    "https://raw.githubusercontent.com/Neskol/Maichart-Converts/refs/heads/master/index.json";
const DEFAULT_INDEX_MIRROR: &str = "https://gh-proxy.org/";
const DEFAULT_ORIGIN_BASE_URL: &str = "https://api.milkbot.cn/server/api";

/// Chart cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Directory holding packages, the index copy and the recency hint.
    pub cache_dir: PathBuf,

    /// Maximum number of distinct ids retaining any cached file.
    pub capacity: usize,

    /// URL of the chart index (JSON object keyed by chart id).
    pub index_url: String,

    /// Prefixes prepended to `index_url` when the direct request fails.
    pub index_mirrors: Vec<String>,

    /// Base URL of the package origin.
    pub origin_base_url: String,

    /// Timeout applied to every network request.
    pub request_timeout_secs: u64,

    /// Origin responses smaller than this are rejected as truncated.
    pub min_package_bytes: u64,

    /// Extensions (without dot) of package entries treated as embedded video.
    pub video_extensions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            capacity: DEFAULT_CAPACITY,
            index_url: DEFAULT_INDEX_URL.to_string(),
            index_mirrors: vec![DEFAULT_INDEX_MIRROR.to_string()],
            origin_base_url: DEFAULT_ORIGIN_BASE_URL.to_string(),
            request_timeout_secs: 10,
            min_package_bytes: 1024,
            video_extensions: vec!["mp4".to_string()],
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("lyra")
        .join("charts")
}

impl CacheConfig {
    /// Create a default configuration rooted at `cache_dir`.
    #[must_use]
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or a value is out
    /// of range.
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, applying the environment override.
    ///
    /// A missing `path` yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    source: e,
                    path: path.to_path_buf(),
                })?;
                Self::from_toml_str(&content, path)?
            }
            None => Self::default(),
        };
        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `LYRA_CACHE_DIR` if set.
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            tracing::debug!(dir = ?dir, "Cache directory overridden from environment");
            self.cache_dir = PathBuf::from(dir);
        }
        self
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity < MIN_CAPACITY {
            return Err(ConfigError::invalid(format!(
                "capacity must be at least {MIN_CAPACITY}, got {}",
                self.capacity
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("requestTimeoutSecs must be positive"));
        }
        if self.video_extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "videoExtensions must name at least one extension",
            ));
        }
        Ok(())
    }

    /// Network request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Index URLs in the order they are tried.
    #[must_use]
    pub fn index_urls(&self) -> Vec<String> {
        std::iter::once(self.index_url.clone())
            .chain(
                self.index_mirrors
                    .iter()
                    .map(|mirror| format!("{mirror}{}", self.index_url)),
            )
            .collect()
    }
}
