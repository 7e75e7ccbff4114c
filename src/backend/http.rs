//! HTTP backend: `GET {base_url}/resource/{key}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};

use super::Backend;
use crate::{FleetCacheError, Result};

/// Transport-level timeout. The proxy applies its own, usually shorter,
/// `backend_timeout` on top.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Backend that fetches resources from an HTTP service.
///
/// A 2xx response body is the payload; any other status becomes
/// [`FleetCacheError::Api`]. The key is sent as a single percent-encoded
/// path segment, so reserved characters (`/`, `?`, `#`, `%`) stay part of
/// the key.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
}

impl HttpBackend {
    /// Create a backend for the service at `base_url`.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| FleetCacheError::Configuration(format!("HTTP client: {e}")))?;
        Self::with_client(http, base_url)
    }

    /// Use a preconfigured client.
    pub fn with_client(http: Client, base_url: impl AsRef<str>) -> Result<Self> {
        let raw = base_url.as_ref();
        let base_url = Url::parse(raw).map_err(|e| {
            FleetCacheError::Configuration(format!("invalid backend URL '{raw}': {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(FleetCacheError::Configuration(format!(
                "backend URL '{raw}' cannot carry a path"
            )));
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    fn resource_url(&self, key: &str) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `with_client`: a base URL always has path segments.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("resource").push(key);
        }
        url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.resource_url(key))
            .send()
            .await
            .map_err(|e| FleetCacheError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FleetCacheError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FleetCacheError::Http(e.to_string()))?;
        Ok(body.to_vec())
    }
}
