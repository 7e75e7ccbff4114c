//! Fetch-lease protocol over the shared [`RecordStore`].
//!
//! For a key, [`LeaseCoordinator::decide`] reads the record and returns one
//! of three outcomes:
//!
//! ```text
//!                     find(key)
//!                         │
//!        ┌────────────────┼─────────────────────────┐
//!        │ absent         │ present                 │
//!        ▼                ▼                         │
//!  insert(leased) ── fresh value? ──yes──► HIT      │
//!   │        │            │ no                      │
//!   │ ok     │ conflict   ▼                         │
//!   ▼        └──► re-read lease live? ──yes──► WAIT │
//! ACQUIRE                 │ no                      │
//!                         ▼                         │
//!        compare_and_update(expected = read token)  │
//!           │ ok                   │ lost           │
//!           ▼                      └──► re-read ────┘
//!        ACQUIRE
//! ```
//!
//! Only the store's insert uniqueness and conditional update decide a
//! race, so two instances claiming the same key produce exactly one
//! ACQUIRE. Lost races are not errors; the coordinator just re-reads.
//!
//! A live lease held by this instance's own identity means a sibling task
//! here is already fetching, so it also yields WAIT.

mod guard;

pub use guard::LeaseGuard;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{Clock, add_duration};
use crate::config::FailurePolicy;
use crate::context::RequestContext;
use crate::store::{Filter, RecordStore};
use crate::telemetry;
use crate::types::{CacheRecord, InstanceId, RecordId};
use crate::{FleetCacheError, Result};

/// Re-reads allowed after lost races within one `decide` call before it
/// settles for WAIT.
const MAX_RACE_REREADS: u32 = 16;

/// A fetch lease held by this instance.
#[derive(Debug, Clone)]
pub struct Lease {
    pub record_id: RecordId,
    pub key: String,
    pub owner: InstanceId,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of consulting the lease protocol for a key.
#[derive(Debug, Clone)]
pub enum LeaseDecision {
    /// The record holds a servable value.
    Hit {
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    },
    /// This instance now owns the lease and should call the backend.
    Acquire(Lease),
    /// Someone else (or a sibling task) is fetching; back off and re-check.
    Wait {
        holder: Option<InstanceId>,
        lease_expires_at: Option<DateTime<Utc>>,
    },
}

/// Creates, claims, steals and releases fetch leases for one instance.
///
/// Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct LeaseCoordinator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    owner: InstanceId,
    lease_timeout: Duration,
    cache_ttl: Duration,
    failure_policy: FailurePolicy,
}

impl LeaseCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        owner: InstanceId,
        lease_timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            owner,
            lease_timeout,
            cache_ttl,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn owner(&self) -> &InstanceId {
        &self.owner
    }

    /// Current record for `key`, if any.
    pub async fn find_record(&self, key: &str) -> Result<Option<CacheRecord>> {
        let mut found = self.store.find(&[Filter::Key(key.to_string())]).await?;
        if found.len() > 1 {
            warn!(key, count = found.len(), "multiple records for one key, using the first");
        }
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Decide HIT, ACQUIRE or WAIT for `key`.
    ///
    /// Store failures propagate as `StoreUnavailable`; lost races are
    /// retried internally.
    pub async fn decide(&self, key: &str) -> Result<LeaseDecision> {
        self.decide_within(&RequestContext::background(), key).await
    }

    /// [`decide`](Self::decide), giving up on record reads once `ctx` ends.
    ///
    /// Only reads race the context. A started insert or claim always runs
    /// to completion so a lease is never taken without being reported.
    pub async fn decide_within(&self, ctx: &RequestContext, key: &str) -> Result<LeaseDecision> {
        let mut rereads = 0;
        loop {
            let Some(record) = ctx.run(self.find_record(key)).await? else {
                let lease_until = add_duration(self.clock.now(), self.lease_timeout);
                let fresh = CacheRecord::leased(key, self.owner.clone(), lease_until);
                match self.store.insert(fresh).await {
                    Ok(record_id) => {
                        metrics::counter!(telemetry::LEASE_ACQUIRED_TOTAL, "mode" => "insert")
                            .increment(1);
                        debug!(key, %record_id, "created record with lease");
                        return Ok(LeaseDecision::Acquire(self.lease(record_id, key, lease_until)));
                    }
                    Err(FleetCacheError::KeyConflict(_)) => {
                        metrics::counter!(telemetry::LEASE_RACES_TOTAL).increment(1);
                        debug!(key, "lost record creation race, re-reading");
                        if self.note_race(&mut rereads) {
                            return Ok(LeaseDecision::Wait {
                                holder: None,
                                lease_expires_at: None,
                            });
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            let now = self.clock.now();
            let lease_until = add_duration(now, self.lease_timeout);

            if record.has_fresh_value(now)
                && let Some(expires_at) = record.expires_at
            {
                return Ok(LeaseDecision::Hit {
                    value: record.value,
                    expires_at,
                });
            }

            if record.lease_is_live(now) {
                return Ok(LeaseDecision::Wait {
                    holder: record.lock_token,
                    lease_expires_at: record.lock_expires_at,
                });
            }

            // Lease free or abandoned: claim it, guarded on the token we read.
            let expected = record.lock_token.clone();
            let mut claimed = record;
            claimed.claim(self.owner.clone(), lease_until);
            let record_id = claimed.id.clone();
            if self
                .store
                .compare_and_update(&record_id, claimed, expected.as_ref())
                .await?
            {
                metrics::counter!(telemetry::LEASE_ACQUIRED_TOTAL, "mode" => "claim").increment(1);
                match &expected {
                    Some(previous) if *previous != self.owner => {
                        debug!(key, %record_id, %previous, "took over abandoned lease")
                    }
                    _ => debug!(key, %record_id, "claimed lease"),
                }
                return Ok(LeaseDecision::Acquire(self.lease(record_id, key, lease_until)));
            }

            metrics::counter!(telemetry::LEASE_RACES_TOTAL).increment(1);
            debug!(key, "lost lease claim race, re-reading");
            if self.note_race(&mut rereads) {
                return Ok(LeaseDecision::Wait {
                    holder: None,
                    lease_expires_at: None,
                });
            }
        }
    }

    /// Store a fetched value and release the lease.
    ///
    /// Every write is conditional on the lock token just read. If the lease
    /// was taken over after it expired, the value is still written but the
    /// new holder's lease fields are left intact. Returns the value's expiry.
    pub async fn complete(&self, lease: &Lease, value: Vec<u8>) -> Result<DateTime<Utc>> {
        let expires_at = add_duration(self.clock.now(), self.cache_ttl);
        let mut rereads = 0;
        loop {
            let mut record = self.store.get(&lease.record_id).await?.ok_or_else(|| {
                FleetCacheError::StoreUnavailable(format!(
                    "record {} for key '{}' disappeared during fetch",
                    lease.record_id, lease.key
                ))
            })?;

            let expected = record.lock_token.clone();
            let still_ours = record.is_held_by(&self.owner);
            record.value = value.clone();
            record.expires_at = Some(expires_at);
            if still_ours {
                record.clear_lease();
            }

            if self
                .store
                .compare_and_update(&lease.record_id, record, expected.as_ref())
                .await?
            {
                if !still_ours {
                    warn!(
                        key = %lease.key,
                        record_id = %lease.record_id,
                        holder = ?expected,
                        "lease was taken over during fetch; stored value without touching new lease"
                    );
                }
                return Ok(expires_at);
            }

            metrics::counter!(telemetry::LEASE_RACES_TOTAL).increment(1);
            debug!(key = %lease.key, "lease changed while storing value, re-reading");
            if self.note_race(&mut rereads) {
                warn!(
                    key = %lease.key,
                    record_id = %lease.record_id,
                    "gave up storing fetched value after repeated races"
                );
                return Ok(expires_at);
            }
        }
    }

    /// Release the lease after a failed or abandoned fetch.
    ///
    /// Clears only the lease fields (and, under
    /// [`FailurePolicy::ClearStale`], an already expired value). The write
    /// is conditional on this instance still holding the lease; if it has
    /// passed on, nothing changes.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let Some(mut record) = self.store.get(&lease.record_id).await? else {
            return Ok(());
        };
        if !record.is_held_by(&self.owner) {
            debug!(
                key = %lease.key,
                holder = ?record.lock_token,
                "lease already passed on, nothing to release"
            );
            return Ok(());
        }

        record.clear_lease();
        if self.failure_policy == FailurePolicy::ClearStale
            && !record.has_fresh_value(self.clock.now())
        {
            record.clear_value();
        }
        let released = self
            .store
            .compare_and_update(&lease.record_id, record, Some(&self.owner))
            .await?;
        if !released {
            debug!(key = %lease.key, "lease passed on before release, nothing to release");
        }
        Ok(())
    }

    fn lease(&self, record_id: RecordId, key: &str, expires_at: DateTime<Utc>) -> Lease {
        Lease {
            record_id,
            key: key.to_string(),
            owner: self.owner.clone(),
            expires_at,
        }
    }

    /// Count a lost race; true once the re-read allowance is used up.
    fn note_race(&self, rereads: &mut u32) -> bool {
        *rereads += 1;
        *rereads > MAX_RACE_REREADS
    }
}
