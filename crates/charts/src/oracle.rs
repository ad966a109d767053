//! Set of chart ids known to exist upstream.
//!
//! The set gates requests before any disk or network work happens. It is
//! fail-open: when no index could be loaded every id is considered known.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::artifact::ChartId;
use crate::config::CacheConfig;
use crate::error::{ConfigError, OracleError};
use crate::origin::http_client;
use crate::store::write_atomic;

/// Supplies the raw chart index.
#[async_trait]
pub trait IndexSource: Send + Sync {
    /// Fetch the index document: a JSON object keyed by chart id.
    async fn fetch_index(&self) -> Result<Vec<u8>, OracleError>;
}

/// Index fetched over HTTP, trying each configured URL in turn.
#[derive(Debug, Clone)]
pub struct HttpIndexSource {
    client: Client,
    urls: Vec<String>,
}

impl HttpIndexSource {
    /// Create a source for the configured index URL and its mirrors.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client(config)?,
            urls: config.index_urls(),
        })
    }

    /// URLs in the order they are tried.
    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, OracleError> {
        let request_error = |message: String| OracleError::Request {
            url: url.to_string(),
            message,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(request_error(format!("HTTP {}", response.status())));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| request_error(e.to_string()))
    }
}

#[async_trait]
impl IndexSource for HttpIndexSource {
    async fn fetch_index(&self) -> Result<Vec<u8>, OracleError> {
        let mut last_error = None;
        for url in &self.urls {
            debug!(%url, "Fetching chart index");
            match self.get(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(%url, error = %e, "Chart index request failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| OracleError::Request {
            url: String::new(),
            message: "no index URLs configured".to_string(),
        }))
    }
}

/// Ids known to exist upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidityOracle {
    known: HashSet<ChartId>,
}

impl ValidityOracle {
    /// An oracle with no index, which accepts every id.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// An oracle over an explicit id set.
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = ChartId>) -> Self {
        Self {
            known: ids.into_iter().collect(),
        }
    }

    /// Parse an index document.
    ///
    /// Keys that are not positive integers are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a JSON object.
    pub fn parse_index(raw: &[u8]) -> Result<Self, OracleError> {
        let index: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(raw)?;
        let mut known = HashSet::with_capacity(index.len());
        for key in index.keys() {
            match key.parse::<ChartId>() {
                Ok(id) => {
                    known.insert(id);
                }
                Err(_) => warn!(key = %key, "Skipping non-numeric chart index key"),
            }
        }
        Ok(Self { known })
    }

    /// Load the local index copy.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_fallback(path: &Path) -> Result<Option<Self>, OracleError> {
        match std::fs::read(path) {
            Ok(raw) => Self::parse_index(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OracleError::Io {
                source: e,
                path: path.to_path_buf(),
                operation: "read".to_string(),
            }),
        }
    }

    /// Fetch the remote index, falling back to the local copy.
    ///
    /// A successfully fetched index replaces the local copy at
    /// `fallback_path`. Every failure is logged; when nothing can be loaded
    /// the result is the empty (fail-open) oracle.
    pub async fn refresh(source: &dyn IndexSource, fallback_path: &Path) -> Self {
        let remote = match source.fetch_index().await {
            Ok(raw) => Self::parse_index(&raw).map(|oracle| (oracle, raw)),
            Err(e) => Err(e),
        };

        match remote {
            Ok((oracle, raw)) => {
                if let Err(e) = write_atomic(fallback_path, &raw) {
                    warn!(path = ?fallback_path, error = %e, "Failed to save chart index copy");
                }
                info!(known = oracle.len(), "Loaded chart index");
                oracle
            }
            Err(e) => {
                warn!(error = %e, "Chart index unavailable; using local copy");
                match Self::load_fallback(fallback_path) {
                    Ok(Some(oracle)) => {
                        info!(known = oracle.len(), path = ?fallback_path, "Loaded local chart index");
                        oracle
                    }
                    Ok(None) => {
                        warn!("No chart index available; accepting every id");
                        Self::empty()
                    }
                    Err(e) => {
                        warn!(error = %e, "Local chart index unreadable; accepting every id");
                        Self::empty()
                    }
                }
            }
        }
    }

    /// Whether `id` may be requested. Always true when the set is empty.
    #[must_use]
    pub fn is_known(&self, id: ChartId) -> bool {
        self.known.is_empty() || self.known.contains(&id)
    }

    /// Number of known ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no index is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
