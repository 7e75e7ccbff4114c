//! The cache proxy: public entry point composing local cache, lease
//! protocol, concurrency limiter and backend.
//!
//! # Request flow
//!
//! ```text
//! get_resource(key)
//!   │
//!   ├─► LocalCache hit ─────────────────────────────► return (no store access)
//!   │
//!   ├─► loop: LeaseCoordinator::decide_within(ctx, key) (reads honour ctx)
//!   │      HIT     → refresh LocalCache ─────────────► return
//!   │      WAIT    → sleep backoff (≤ wait budget, honours ctx), retry
//!   │      ACQUIRE → break
//!   │
//!   ├─► ConcurrencyLimiter slot (honours ctx)
//!   ├─► Backend::fetch under backend_timeout (honours ctx)
//!   │
//!   ├─► ok:  store value, clear lease, refresh LocalCache ─► return value
//!   └─► err: clear lease only (best effort) ───────────────► return err
//! ```
//!
//! Each ACQUIRE costs one store write on entry, one on exit, and exactly
//! one backend call. The backend is never retried here.

mod builder;
pub mod recovery;

pub use builder::CacheProxyBuilder;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant as StdInstant;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::backend::Backend;
use crate::cache::{CleanupHandle, LocalCache};
use crate::config::ProxyConfig;
use crate::context::RequestContext;
use crate::lease::{LeaseCoordinator, LeaseDecision, LeaseGuard};
use crate::limiter::ConcurrencyLimiter;
use crate::telemetry;
use crate::types::InstanceId;
use crate::{FleetCacheError, Result};

/// Result of the lease wait loop.
enum Admission {
    Hit(Vec<u8>),
    Lease(LeaseGuard),
}

/// Single-flight, lease-coordinated cache in front of a slow backend.
///
/// Construct with [`CacheProxy::builder()`]. Share between tasks with an
/// `Arc`; several proxies with distinct identities sharing one
/// [`RecordStore`](crate::store::RecordStore) behave as a fleet.
pub struct CacheProxy {
    instance_id: InstanceId,
    config: ProxyConfig,
    local: Arc<LocalCache>,
    coordinator: LeaseCoordinator,
    limiter: ConcurrencyLimiter,
    backend: Arc<dyn Backend>,
    cleanup: Mutex<Option<CleanupHandle>>,
}

impl CacheProxy {
    /// Create a new builder for configuring the proxy.
    pub fn builder() -> CacheProxyBuilder {
        CacheProxyBuilder::new()
    }

    /// This instance's identity (its lease lock token).
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn local_cache(&self) -> &LocalCache {
        &self.local
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Fetch `key` with no cancellation and no deadline beyond the
    /// configured wait budget and backend timeout.
    pub async fn get_resource(&self, key: &str) -> Result<Vec<u8>> {
        self.get_resource_with(&RequestContext::background(), key)
            .await
    }

    /// Fetch `key`, giving up when `ctx` is cancelled or its deadline passes.
    ///
    /// # Errors
    ///
    /// - backend errors (`Backend`, `BackendTimeout`, `Http`, `Api`) as
    ///   returned by the backend; the lease is released
    /// - `StoreUnavailable` if the record store fails
    /// - `LeaseWaitTimeout` if another instance held the key longer than
    ///   `max_wait_budget`
    /// - `Cancelled` / `DeadlineExceeded` when `ctx` ends first
    #[instrument(skip(self, ctx), fields(instance = %self.instance_id))]
    pub async fn get_resource_with(&self, ctx: &RequestContext, key: &str) -> Result<Vec<u8>> {
        if let Some(value) = self.local.get(key) {
            metrics::counter!(telemetry::LOOKUPS_TOTAL, "source" => "local").increment(1);
            debug!("local cache hit");
            return Ok(value);
        }

        let guard = match self.await_lease(ctx, key).await? {
            Admission::Hit(value) => {
                metrics::counter!(telemetry::LOOKUPS_TOTAL, "source" => "store").increment(1);
                return Ok(value);
            }
            Admission::Lease(guard) => guard,
        };

        let value = self.fetch_and_store(ctx, guard).await?;
        metrics::counter!(telemetry::LOOKUPS_TOTAL, "source" => "backend").increment(1);
        Ok(value)
    }

    /// Stop the cleanup task and close the limiter. Calls already holding a
    /// limiter slot finish normally; new backend calls fail with
    /// `LimiterClosed`.
    pub async fn shutdown(&self) {
        let handle = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.limiter.close();
        debug!(instance = %self.instance_id, "cache proxy shut down");
    }

    /// Consult the lease protocol until HIT or ACQUIRE, backing off on WAIT.
    async fn await_lease(&self, ctx: &RequestContext, key: &str) -> Result<Admission> {
        let started = Instant::now();
        let budget = self.config.max_wait_budget;
        let mut attempt: u32 = 0;

        loop {
            ctx.check()?;
            match self.coordinator.decide_within(ctx, key).await? {
                LeaseDecision::Hit { value, expires_at } => {
                    self.local.put(key, value.clone(), expires_at);
                    debug!(attempt, "store hit");
                    return Ok(Admission::Hit(value));
                }
                LeaseDecision::Acquire(lease) => {
                    debug!(record_id = %lease.record_id, "lease acquired");
                    return Ok(Admission::Lease(LeaseGuard::new(
                        self.coordinator.clone(),
                        lease,
                    )));
                }
                LeaseDecision::Wait {
                    holder,
                    lease_expires_at,
                } => {
                    metrics::counter!(telemetry::LEASE_WAITS_TOTAL).increment(1);
                    let waited = started.elapsed();
                    let remaining = budget.saturating_sub(waited);
                    if remaining.is_zero() {
                        warn!(
                            waited_ms = waited.as_millis() as u64,
                            holder = ?holder,
                            "gave up waiting for lease"
                        );
                        return Err(FleetCacheError::LeaseWaitTimeout {
                            key: key.to_string(),
                            waited,
                        });
                    }
                    let delay = self.config.wait_backoff.delay_for_attempt(attempt).min(remaining);
                    debug!(
                        holder = ?holder,
                        lease_expires_at = ?lease_expires_at,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "lease held elsewhere, waiting"
                    );
                    attempt = attempt.saturating_add(1);
                    ctx.sleep(delay).await?;
                }
            }
        }
    }

    /// Run the backend call under a limiter slot and settle the lease.
    async fn fetch_and_store(&self, ctx: &RequestContext, guard: LeaseGuard) -> Result<Vec<u8>> {
        let key = guard.lease().key.clone();

        let fetched = match self.limiter.acquire(ctx).await {
            Ok(permit) => {
                let result = self.call_backend(ctx, &key).await;
                drop(permit);
                result
            }
            Err(e) => Err(e),
        };

        match fetched {
            Ok(value) => {
                let expires_at = guard.complete(value.clone()).await?;
                self.local.put(key, value.clone(), expires_at);
                Ok(value)
            }
            Err(err) => {
                // The fetch error wins; a failed release lapses at lease expiry.
                if let Err(release_err) = guard.release().await {
                    metrics::counter!(telemetry::LEASE_RELEASE_FAILURES_TOTAL).increment(1);
                    warn!(error = %release_err, "failed to release lease after fetch error");
                }
                Err(err)
            }
        }
    }

    async fn call_backend(&self, ctx: &RequestContext, key: &str) -> Result<Vec<u8>> {
        let timeout = self.config.backend_timeout;
        let started = StdInstant::now();

        let result = ctx
            .run(async {
                match tokio::time::timeout(timeout, self.backend.fetch(key)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(FleetCacheError::BackendTimeout { timeout }),
                }
            })
            .await;

        metrics::histogram!(telemetry::BACKEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::BACKEND_REQUESTS_TOTAL, "status" => status).increment(1);

        if let Err(e) = &result {
            debug!(backend = self.backend.name(), error = %e, "backend fetch failed");
        }
        result
    }
}
