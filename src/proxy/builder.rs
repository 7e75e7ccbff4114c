//! Builder for configuring proxy instances

use std::sync::{Arc, Mutex};

use tracing::info;

use super::CacheProxy;
use super::recovery::recover_stale_leases;
use crate::backend::Backend;
use crate::cache::{LocalCache, spawn_cleanup};
use crate::clock::{Clock, SystemClock};
use crate::config::ProxyConfig;
use crate::lease::LeaseCoordinator;
use crate::limiter::ConcurrencyLimiter;
use crate::store::RecordStore;
use crate::types::InstanceId;
use crate::{FleetCacheError, Result};

/// Builder for [`CacheProxy`].
///
/// A record store and a backend are required; the clock defaults to the
/// system clock and the configuration to [`ProxyConfig::default()`].
pub struct CacheProxyBuilder {
    config: ProxyConfig,
    store: Option<Arc<dyn RecordStore>>,
    backend: Option<Arc<dyn Backend>>,
    clock: Arc<dyn Clock>,
}

impl CacheProxyBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            store: None,
            backend: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared record store used for lease coordination.
    pub fn store<S: RecordStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend<B: Backend + 'static>(mut self, backend: Arc<B>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: Arc<C>) -> Self {
        self.clock = clock;
        self
    }

    /// Reuse a fixed identity, e.g. to recover leases after a restart.
    pub fn instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.config.instance_id = Some(id.into());
        self
    }

    /// Validate configuration, run startup recovery, start the cleanup
    /// task and return the ready proxy.
    ///
    /// Must be called within a tokio runtime.
    pub async fn build(self) -> Result<CacheProxy> {
        let config = self.config;
        config.validate()?;

        let store = self.store.ok_or_else(|| {
            FleetCacheError::Configuration("no record store configured".to_string())
        })?;
        let backend = self
            .backend
            .ok_or_else(|| FleetCacheError::Configuration("no backend configured".to_string()))?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(InstanceId::generate);

        let recovered = recover_stale_leases(store.as_ref(), &instance_id).await?;

        let local = Arc::new(LocalCache::new(Arc::clone(&self.clock)));
        let coordinator = LeaseCoordinator::new(
            store,
            self.clock,
            instance_id.clone(),
            config.lease_timeout,
            config.cache_ttl,
        )
        .with_failure_policy(config.failure_policy);
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);
        let cleanup = spawn_cleanup(Arc::clone(&local), config.effective_cleanup_interval());

        info!(
            instance = %instance_id,
            recovered,
            max_concurrency = config.max_concurrency,
            cache_ttl_ms = config.cache_ttl.as_millis() as u64,
            lease_timeout_ms = config.lease_timeout.as_millis() as u64,
            "cache proxy ready"
        );

        Ok(CacheProxy {
            instance_id,
            config,
            local,
            coordinator,
            limiter,
            backend,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }
}

impl Default for CacheProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
