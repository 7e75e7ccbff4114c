//! Shared record store interface.
//!
//! The store is the only state shared between instances. The lease
//! protocol relies on exactly two guarantees from it:
//!
//! - [`insert`](RecordStore::insert) rejects a second record for the same
//!   key with [`KeyConflict`](crate::FleetCacheError::KeyConflict), so two
//!   instances racing to create a record produce one winner.
//! - [`compare_and_update`](RecordStore::compare_and_update) is atomic: it
//!   writes only if the stored lock token still equals the expected one.
//!
//! Every other failure should surface as
//! [`StoreUnavailable`](crate::FleetCacheError::StoreUnavailable).

pub mod memory;

pub use memory::InMemoryRecordStore;

use async_trait::async_trait;

use crate::Result;
use crate::types::{CacheRecord, InstanceId, RecordId};

/// Predicate for [`RecordStore::find`]. Multiple filters are ANDed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `key == value`
    Key(String),
    /// `lock_token == value`
    LockToken(InstanceId),
    /// `in_progress == value`
    InProgress(bool),
}

impl Filter {
    pub fn matches(&self, record: &CacheRecord) -> bool {
        match self {
            Filter::Key(key) => record.key == *key,
            Filter::LockToken(token) => record.lock_token.as_ref() == Some(token),
            Filter::InProgress(flag) => record.in_progress == *flag,
        }
    }
}

/// Persistent store shared by all instances of the fleet.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a new record and return its assigned id.
    ///
    /// The `id` field of `record` is ignored. Returns `KeyConflict` if a
    /// record with the same key already exists.
    async fn insert(&self, record: CacheRecord) -> Result<RecordId>;

    /// Point lookup by id.
    async fn get(&self, id: &RecordId) -> Result<Option<CacheRecord>>;

    /// All records matching every filter.
    async fn find(&self, filters: &[Filter]) -> Result<Vec<CacheRecord>>;

    /// Overwrite the record unconditionally.
    async fn update(&self, id: &RecordId, record: CacheRecord) -> Result<()>;

    /// Overwrite the record only if its stored lock token equals
    /// `expected_token`. Returns `Ok(false)` when the condition fails.
    async fn compare_and_update(
        &self,
        id: &RecordId,
        record: CacheRecord,
        expected_token: Option<&InstanceId>,
    ) -> Result<bool>;
}
