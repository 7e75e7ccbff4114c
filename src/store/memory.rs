//! In-process [`RecordStore`].
//!
//! Backs single-node deployments and tests. Share one
//! `Arc<InMemoryRecordStore>` between several proxies to simulate a fleet:
//! each proxy has its own identity, local cache and limiter, and they
//! coordinate only through this store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Filter, RecordStore};
use crate::types::{CacheRecord, InstanceId, RecordId};
use crate::{FleetCacheError, Result};

#[derive(Default)]
struct State {
    records: HashMap<RecordId, CacheRecord>,
    by_key: HashMap<String, RecordId>,
}

/// Thread-safe in-memory record store with unique keys and atomic
/// conditional updates.
pub struct InMemoryRecordStore {
    state: RwLock<State>,
    available: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FleetCacheError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep the key index consistent with a replacement record.
fn write_record(state: &mut State, id: &RecordId, mut record: CacheRecord) -> Result<()> {
    let Some(previous) = state.records.get(id) else {
        return Err(FleetCacheError::StoreUnavailable(format!(
            "record {id} does not exist"
        )));
    };
    if previous.key != record.key {
        if state.by_key.contains_key(&record.key) {
            return Err(FleetCacheError::KeyConflict(record.key));
        }
        state.by_key.remove(&previous.key);
        state.by_key.insert(record.key.clone(), id.clone());
    }
    record.id = id.clone();
    state.records.insert(id.clone(), record);
    Ok(())
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, mut record: CacheRecord) -> Result<RecordId> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if state.by_key.contains_key(&record.key) {
            return Err(FleetCacheError::KeyConflict(record.key));
        }
        let id = RecordId::new(uuid::Uuid::new_v4().to_string());
        record.id = id.clone();
        state.by_key.insert(record.key.clone(), id.clone());
        state.records.insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &RecordId) -> Result<Option<CacheRecord>> {
        self.ensure_available()?;
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<CacheRecord>> {
        self.ensure_available()?;
        let state = self.state.read().await;

        // Key lookups go through the index.
        if let Some(Filter::Key(key)) = filters.first() {
            return Ok(state
                .by_key
                .get(key)
                .and_then(|id| state.records.get(id))
                .filter(|record| filters.iter().all(|f| f.matches(record)))
                .cloned()
                .into_iter()
                .collect());
        }

        Ok(state
            .records
            .values()
            .filter(|record| filters.iter().all(|f| f.matches(record)))
            .cloned()
            .collect())
    }

    async fn update(&self, id: &RecordId, record: CacheRecord) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        write_record(&mut state, id, record)
    }

    async fn compare_and_update(
        &self,
        id: &RecordId,
        record: CacheRecord,
        expected_token: Option<&InstanceId>,
    ) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let matches = state
            .records
            .get(id)
            .is_some_and(|current| current.lock_token.as_ref() == expected_token);
        if !matches {
            return Ok(false);
        }
        write_record(&mut state, id, record)?;
        Ok(true)
    }
}
