//! Backend resource fetchers.
//!
//! The backend is slow (hundreds of milliseconds to seconds) and
//! idempotent. The proxy calls it at most once per acquired lease and never
//! retries; retry policy belongs to the caller of
//! [`CacheProxy::get_resource`](crate::CacheProxy::get_resource).
//!
//! Errors returned by [`Backend::fetch`] reach the caller unchanged.

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpBackend;

use async_trait::async_trait;

use crate::Result;

/// A slow, idempotent resource fetcher.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging/debugging.
    fn name(&self) -> &str {
        "backend"
    }

    /// Fetch the payload for `key`.
    ///
    /// May be dropped mid-flight when the caller cancels or the backend
    /// timeout fires.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}
