use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Lease, LeaseCoordinator};
use crate::Result;
use crate::telemetry;

/// Scoped ownership of an acquired lease.
///
/// Consume it with [`complete`](Self::complete) or
/// [`release`](Self::release). If it is dropped while still armed (the
/// owning future was cancelled by being dropped, or a panic unwound
/// through it) a best-effort release is spawned on the current tokio
/// runtime. Should that fail too, the lease lapses at its expiry.
pub struct LeaseGuard {
    coordinator: LeaseCoordinator,
    lease: Lease,
    armed: bool,
}

impl LeaseGuard {
    pub fn new(coordinator: LeaseCoordinator, lease: Lease) -> Self {
        Self {
            coordinator,
            lease,
            armed: true,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Write the fetched value and release the lease.
    pub async fn complete(mut self, value: Vec<u8>) -> Result<DateTime<Utc>> {
        let result = self.coordinator.complete(&self.lease, value).await;
        self.armed = false;
        result
    }

    /// Release the lease without storing a value.
    pub async fn release(mut self) -> Result<()> {
        let result = self.coordinator.release(&self.lease).await;
        self.armed = false;
        result
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.lease.key, "lease dropped outside a runtime; left to expire");
            return;
        };
        let coordinator = self.coordinator.clone();
        let lease = self.lease.clone();
        debug!(key = %lease.key, "releasing lease of abandoned fetch");
        runtime.spawn(async move {
            if let Err(e) = coordinator.release(&lease).await {
                metrics::counter!(telemetry::LEASE_RELEASE_FAILURES_TOTAL).increment(1);
                warn!(key = %lease.key, error = %e, "failed to release abandoned lease");
            }
        });
    }
}
