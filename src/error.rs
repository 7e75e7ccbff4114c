//! Fleetcache error types

use std::time::Duration;

/// Fleetcache error types
#[derive(Debug, thiserror::Error)]
pub enum FleetCacheError {
    // Backend errors
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend call exceeded {timeout:?}")]
    BackendTimeout { timeout: Duration },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    // Store errors
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record for this key already exists. Raised by
    /// [`RecordStore::insert`](crate::store::RecordStore::insert) when two
    /// instances race to create the same record; the loser re-reads.
    #[error("record already exists for key '{0}'")]
    KeyConflict(String),

    // Coordination errors
    /// Another instance held the fetch lease for longer than the caller's
    /// wait budget.
    #[error("timed out after {waited:?} waiting for lease on key '{key}'")]
    LeaseWaitTimeout { key: String, waited: Duration },

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("concurrency limiter closed")]
    LimiterClosed,

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl FleetCacheError {
    /// Whether the error came from the backend (including transport and
    /// timeout failures).
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::BackendTimeout { .. } | Self::Http(_) | Self::Api { .. }
        )
    }

    /// Whether the caller's context ended the request.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Whether the shared record store failed.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<toml::de::Error> for FleetCacheError {
    fn from(err: toml::de::Error) -> Self {
        FleetCacheError::Configuration(err.to_string())
    }
}

/// Result type alias for fleetcache operations
pub type Result<T> = std::result::Result<T, FleetCacheError>;
