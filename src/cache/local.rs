//! Per-instance read-through shadow of the shared records.
//!
//! Lookups take a shared read lock, so any number of concurrent readers
//! proceed together; writes take the exclusive lock briefly. An expired
//! entry reads as a miss but is left in place: removal is the cleanup
//! task's job, which keeps the hot path free of write locks.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::types::LocalEntry;

/// In-memory map of key → value + expiry.
#[derive(Debug)]
pub struct LocalCache {
    entries: RwLock<HashMap<String, LocalEntry>>,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Cached value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Insert or overwrite the entry for `key`.
    pub fn put(&self, key: impl Into<String>, value: Vec<u8>, expires_at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), LocalEntry { value, expires_at });
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry and return how many were removed.
    ///
    /// Candidates are collected under the read lock; the write lock is
    /// then taken once and each candidate's expiry is checked again, so an
    /// entry refreshed in between survives.
    pub fn purge_expired(&self) -> usize {
        let candidates = self.expired_keys();
        if candidates.is_empty() {
            return 0;
        }
        self.remove_if_expired(&candidates)
    }

    pub(crate) fn expired_keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn remove_if_expired(&self, keys: &[String]) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for key in keys {
            if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
                entries.remove(key);
                removed += 1;
            }
        }
        removed
    }
}
