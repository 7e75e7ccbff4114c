//! Per-instance admission gate for backend calls.
//!
//! A counting semaphore sized to `max_concurrency`. Waiting for a slot is
//! cooperative (the task parks on the semaphore) and races the caller's
//! [`RequestContext`]. A slot is held by a [`LimiterPermit`] and returned
//! when the permit drops, on every exit path.
//!
//! This bounds one instance only. Cross-instance coordination is the
//! lease protocol's job.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::RequestContext;
use crate::telemetry;
use crate::{FleetCacheError, Result};

/// Bounded admission gate for concurrent backend calls.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One admitted backend call. Dropping it frees the slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        metrics::gauge!(telemetry::LIMITER_IN_FLIGHT).decrement(1.0);
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot, or fail when `ctx` ends or the limiter closes.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<LimiterPermit> {
        let semaphore = Arc::clone(&self.semaphore);
        let permit = ctx
            .run(async move {
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| FleetCacheError::LimiterClosed)
            })
            .await?;
        metrics::gauge!(telemetry::LIMITER_IN_FLIGHT).increment(1.0);
        Ok(LimiterPermit { _permit: permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        metrics::gauge!(telemetry::LIMITER_IN_FLIGHT).increment(1.0);
        Some(LimiterPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Reject all current and future waiters with `LimiterClosed`.
    /// Held permits stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
