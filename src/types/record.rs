//! The shared cache record and its local shadow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InstanceId, RecordId};

/// Persisted cache record, shared by every instance through the
/// [`RecordStore`](crate::store::RecordStore).
///
/// Created lazily on the first miss for a key, mutated only by the
/// instance holding its lease, and never deleted by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: RecordId,
    pub key: String,
    /// Payload bytes. Empty means "not fetched yet".
    #[serde(default)]
    pub value: Vec<u8>,
    /// When `value` goes stale. Meaningless while `value` is empty.
    pub expires_at: Option<DateTime<Utc>>,
    /// Set while some instance holds the fetch lease.
    pub in_progress: bool,
    /// Current lease holder; `None` when no lease is held.
    pub lock_token: Option<InstanceId>,
    /// After this instant the lease counts as abandoned.
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl CacheRecord {
    /// A fresh, valueless record already leased to `owner`.
    pub fn leased(key: impl Into<String>, owner: InstanceId, until: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::unassigned(),
            key: key.into(),
            value: Vec::new(),
            expires_at: None,
            in_progress: true,
            lock_token: Some(owner),
            lock_expires_at: Some(until),
        }
    }

    /// Whether the record holds a value callers may be served at `now`.
    pub fn has_fresh_value(&self, now: DateTime<Utc>) -> bool {
        !self.value.is_empty() && self.expires_at.is_some_and(|at| now < at)
    }

    /// Whether a non-expired lease is held at `now`.
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.in_progress && self.lock_expires_at.is_some_and(|at| now < at)
    }

    pub fn is_held_by(&self, owner: &InstanceId) -> bool {
        self.lock_token.as_ref() == Some(owner)
    }

    /// Take the lease for `owner` until `until`. Leaves the value alone.
    pub fn claim(&mut self, owner: InstanceId, until: DateTime<Utc>) {
        self.in_progress = true;
        self.lock_token = Some(owner);
        self.lock_expires_at = Some(until);
    }

    /// Drop the lease fields. Leaves the value alone.
    pub fn clear_lease(&mut self) {
        self.in_progress = false;
        self.lock_token = None;
        self.lock_expires_at = None;
    }

    /// Forget the value and its expiry.
    pub fn clear_value(&mut self) {
        self.value.clear();
        self.expires_at = None;
    }
}

/// Per-instance shadow of a record's value.
///
/// Never consulted for lease state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl LocalEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
