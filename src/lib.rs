//! fleetcache - single-flight, lease-coordinated cache proxy
//!
//! A fleet of proxy instances sits in front of a slow backend. Each
//! instance keeps an in-process cache; all instances share a
//! [`RecordStore`] through which they elect, per key, exactly one fetcher
//! at a time using a time-bounded lease. Everyone else waits for the
//! fetcher's result instead of calling the backend themselves.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fleetcache::{CacheProxy, HttpBackend, InMemoryRecordStore, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> fleetcache::Result<()> {
//!     let proxy = CacheProxy::builder()
//!         .config(ProxyConfig::new().cache_ttl(Duration::from_secs(600)))
//!         .store(Arc::new(InMemoryRecordStore::new()))
//!         .backend(Arc::new(HttpBackend::new("http://127.0.0.1:8080")?))
//!         .build()
//!         .await?;
//!
//!     let body = proxy.get_resource("42").await?;
//!     println!("{} bytes", body.len());
//!
//!     proxy.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod lease;
pub mod limiter;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use error::{FleetCacheError, Result};
pub use proxy::{CacheProxy, CacheProxyBuilder};

pub use backend::Backend;
#[cfg(feature = "http")]
pub use backend::HttpBackend;
pub use backoff::WaitBackoff;
pub use cache::LocalCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailurePolicy, FileConfig, ProxyConfig};
pub use context::{CancelHandle, CancelSignal, RequestContext, cancel_pair};
pub use lease::{Lease, LeaseCoordinator, LeaseDecision, LeaseGuard};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use store::{Filter, InMemoryRecordStore, RecordStore};
pub use types::{CacheRecord, InstanceId, LocalEntry, RecordId};
