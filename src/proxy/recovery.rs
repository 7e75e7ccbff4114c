//! Startup recovery of leases left behind by a previous run.

use tracing::{info, warn};

use crate::store::{Filter, RecordStore};
use crate::telemetry;
use crate::types::InstanceId;
use crate::Result;

/// Clear every in-progress lease held under `owner`.
///
/// Runs once, before the proxy serves traffic. At that point no fetch of
/// this instance can be running, so every lease carrying its identity is
/// left over from a crash of an earlier run with the same identity. Such a
/// lease is cleared even if its `lock_expires_at` has not passed yet, not
/// only once it has lapsed, so the key is re-acquirable immediately after
/// restart instead of one lease timeout later. Values are left untouched.
/// Leases of other instances are never touched; they lapse by expiry.
///
/// Returns how many records were repaired.
pub async fn recover_stale_leases(store: &dyn RecordStore, owner: &InstanceId) -> Result<usize> {
    let held = store
        .find(&[Filter::LockToken(owner.clone()), Filter::InProgress(true)])
        .await?;

    let mut recovered = 0;
    for mut record in held {
        let id = record.id.clone();
        record.clear_lease();
        match store.update(&id, record).await {
            Ok(()) => recovered += 1,
            Err(e) => {
                warn!(record_id = %id, error = %e, "failed to clear leftover lease");
                return Err(e);
            }
        }
    }

    if recovered > 0 {
        metrics::counter!(telemetry::RECOVERED_LEASES_TOTAL).increment(recovered as u64);
        info!(instance = %owner, recovered, "cleared leases left by previous run");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use crate::types::CacheRecord;
    use chrono::{TimeDelta, Utc};

    #[tokio::test]
    async fn clears_only_own_leases() {
        let store = InMemoryRecordStore::new();
        let me = InstanceId::new("me");
        let until = Utc::now() + TimeDelta::minutes(5);

        let mine = store
            .insert(CacheRecord::leased("a", me.clone(), until))
            .await
            .unwrap();
        let theirs = store
            .insert(CacheRecord::leased("b", InstanceId::new("peer"), until))
            .await
            .unwrap();

        let recovered = recover_stale_leases(&store, &me).await.unwrap();
        assert_eq!(recovered, 1);

        let mine = store.get(&mine).await.unwrap().unwrap();
        assert!(!mine.in_progress);
        assert!(mine.lock_token.is_none());

        let theirs = store.get(&theirs).await.unwrap().unwrap();
        assert!(theirs.in_progress);
    }

    #[tokio::test]
    async fn nothing_to_recover() {
        let store = InMemoryRecordStore::new();
        let recovered = recover_stale_leases(&store, &InstanceId::new("me"))
            .await
            .unwrap();
        assert_eq!(recovered, 0);
    }
}
