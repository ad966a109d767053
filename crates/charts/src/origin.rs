//! Remote source of chart packages.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::artifact::{ChartId, Variant};
use crate::config::CacheConfig;
use crate::error::{ConfigError, FetchError};

/// Fetches package bytes from the origin.
///
/// Implementations must be safe to call concurrently for different ids.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Download the package for `id` in the given variant.
    async fn fetch(&self, id: ChartId, variant: Variant) -> Result<Vec<u8>, FetchError>;
}

/// Build the HTTP client shared by the origin fetcher and the index source.
pub(crate) fn http_client(config: &CacheConfig) -> Result<Client, ConfigError> {
    Client::builder()
        .user_agent(concat!("lyra/", env!("CARGO_PKG_VERSION")))
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| ConfigError::HttpClient {
            message: e.to_string(),
        })
}

/// Origin reached over HTTP.
///
/// Heavy packages come from `{base}/download?id=<id>`, light packages from
/// `{base}/nobga_download?id=<id>`.
#[derive(Debug, Clone)]
pub struct HttpOriginFetcher {
    client: Client,
    base_url: String,
    min_package_bytes: u64,
}

impl HttpOriginFetcher {
    /// Create a fetcher from the cache configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.origin_base_url.trim_end_matches('/').to_string(),
            min_package_bytes: config.min_package_bytes,
        })
    }

    /// URL the package is downloaded from.
    #[must_use]
    pub fn download_url(&self, id: ChartId, variant: Variant) -> String {
        let endpoint = match variant {
            Variant::Heavy => "download",
            Variant::Light => "nobga_download",
        };
        format!("{}/{endpoint}?id={id}", self.base_url)
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    async fn fetch(&self, id: ChartId, variant: Variant) -> Result<Vec<u8>, FetchError> {
        let url = self.download_url(id, variant);
        debug!(%id, %variant, %url, "Requesting package from origin");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::network(id, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound { id });
        }
        if !status.is_success() {
            return Err(FetchError::other(id, format!("HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::network(id, e.to_string()))?;
        if (body.len() as u64) < self.min_package_bytes {
            return Err(FetchError::other(
                id,
                format!(
                    "response of {} bytes is smaller than the {} byte minimum",
                    body.len(),
                    self.min_package_bytes
                ),
            ));
        }

        info!(%id, %variant, bytes = body.len(), "Downloaded package");
        Ok(body.to_vec())
    }
}
