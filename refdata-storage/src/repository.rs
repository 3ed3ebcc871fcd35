//! Version & outbox repository.
//!
//! The only code that moves committed version numbers or writes outbox rows.
//! Everything here runs inside the caller's transaction so the version bump,
//! the data mutation and the outbox row commit or roll back together.

use crate::store::PlatformTx;
use refdata_core::constants::MAX_ALLOCATION_ATTEMPTS;
use refdata_core::{
    DictionaryMeta, InvalidationEvent, NewOutboxEvent, RefdataResult, StorageError, Version,
};
use tracing::debug;

/// Merge an incoming source revision into the stored one.
///
/// `None` carries no information and never clears or lowers a present value.
pub fn merge_source_revision(current: Option<i64>, incoming: Option<i64>) -> Option<i64> {
    match (current, incoming) {
        (Some(c), Some(i)) => Some(c.max(i)),
        (Some(c), None) => Some(c),
        (None, i) => i,
    }
}

/// Whether `source_revision` is not newer than the last applied revision.
pub fn is_stale_revision(meta: Option<&DictionaryMeta>, source_revision: Option<i64>) -> bool {
    match (source_revision, meta.and_then(|m| m.last_source_revision)) {
        (Some(incoming), Some(last)) => incoming <= last,
        _ => false,
    }
}

/// Allocate the next version of a dictionary.
///
/// Tries to bump the existing row; if there is none, inserts version 1.
/// Losing the insert race to another writer loops back to the bump, at most
/// [`MAX_ALLOCATION_ATTEMPTS`] times.
pub async fn allocate_next_version(
    tx: &mut dyn PlatformTx,
    tenant_id: &str,
    dict_code: &str,
    source_revision: Option<i64>,
) -> RefdataResult<Version> {
    for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
        if let Some(version) = tx.increment_meta(tenant_id, dict_code, source_revision).await? {
            return Ok(version);
        }
        if tx.insert_meta_if_absent(tenant_id, dict_code, source_revision).await? {
            return Ok(1);
        }
        debug!(
            tenant_id = %tenant_id,
            dict_code = %dict_code,
            attempt,
            "Lost first-write race on version row, retrying"
        );
    }
    Err(StorageError::VersionAllocationExhausted {
        tenant_id: tenant_id.to_string(),
        dict_code: dict_code.to_string(),
        attempts: MAX_ALLOCATION_ATTEMPTS,
    }
    .into())
}

/// Write the outbox row announcing `event`. Returns the row id.
pub async fn insert_outbox_event(
    tx: &mut dyn PlatformTx,
    event: &InvalidationEvent,
) -> RefdataResult<i64> {
    let row = NewOutboxEvent::from_invalidation(event)?;
    tx.insert_outbox_event(&row).await
}

/// Committed version, 0 when nothing was committed yet.
pub async fn current_committed_version(
    tx: &mut dyn PlatformTx,
    tenant_id: &str,
    dict_code: &str,
) -> RefdataResult<Version> {
    Ok(tx
        .dictionary_meta(tenant_id, dict_code)
        .await?
        .map(|meta| meta.version)
        .unwrap_or(0))
}

pub async fn last_source_revision(
    tx: &mut dyn PlatformTx,
    tenant_id: &str,
    dict_code: &str,
) -> RefdataResult<Option<i64>> {
    Ok(tx
        .dictionary_meta(tenant_id, dict_code)
        .await?
        .and_then(|meta| meta.last_source_revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatformStore;
    use crate::store::PlatformStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use refdata_core::{
        ClaimOutcome, ItemMap, RefdataError, SnapshotChunk, UpdateItem, UpdateRequest,
    };
    use serde_json::Value;
    use std::collections::VecDeque;

    /// Transaction whose version-row primitives follow a script, to force the
    /// lost-race paths that a serialized store never produces.
    struct ScriptedTx {
        increments: VecDeque<Option<Version>>,
        inserts: VecDeque<bool>,
        increment_calls: u32,
    }

    #[async_trait]
    impl PlatformTx for ScriptedTx {
        async fn increment_meta(&mut self, _: &str, _: &str, _: Option<i64>) -> RefdataResult<Option<Version>> {
            self.increment_calls += 1;
            Ok(self.increments.pop_front().flatten())
        }
        async fn insert_meta_if_absent(&mut self, _: &str, _: &str, _: Option<i64>) -> RefdataResult<bool> {
            Ok(self.inserts.pop_front().unwrap_or(false))
        }
        async fn create_update_request_if_absent(&mut self, _: &UpdateRequest) -> RefdataResult<bool> { unimplemented!() }
        async fn find_update_request(&mut self, _: &str, _: &str) -> RefdataResult<Option<UpdateRequest>> { unimplemented!() }
        async fn mark_update_committed(&mut self, _: &str, _: &str, _: Version) -> RefdataResult<bool> { unimplemented!() }
        async fn mark_snapshot_committed(&mut self, _: &str, _: &str, _: &str, _: Version) -> RefdataResult<u64> { unimplemented!() }
        async fn mark_update_failed(&mut self, _: &str, _: &str, _: &str) -> RefdataResult<bool> { unimplemented!() }
        async fn claim_event(&mut self, _: &str, _: &str) -> RefdataResult<ClaimOutcome> { unimplemented!() }
        async fn dictionary_meta(&mut self, _: &str, _: &str) -> RefdataResult<Option<DictionaryMeta>> { unimplemented!() }
        async fn insert_outbox_event(&mut self, _: &NewOutboxEvent) -> RefdataResult<i64> { unimplemented!() }
        async fn save_snapshot_chunk(&mut self, _: &SnapshotChunk) -> RefdataResult<()> { unimplemented!() }
        async fn count_snapshot_chunks(&mut self, _: &str, _: &str, _: &str) -> RefdataResult<u32> { unimplemented!() }
        async fn load_snapshot_items(&mut self, _: &str, _: &str, _: &str) -> RefdataResult<Vec<UpdateItem>> { unimplemented!() }
        async fn clear_snapshot_chunks(&mut self, _: &str, _: &str, _: &str) -> RefdataResult<u64> { unimplemented!() }
        async fn upsert_item(&mut self, _: &str, _: &str, _: &str, _: &Value, _: Version) -> RefdataResult<()> { unimplemented!() }
        async fn delete_item(&mut self, _: &str, _: &str, _: &str) -> RefdataResult<bool> { unimplemented!() }
        async fn clear_items(&mut self, _: &str, _: &str) -> RefdataResult<u64> { unimplemented!() }
        async fn load_items(&mut self, _: &str, _: &str) -> RefdataResult<ItemMap> { unimplemented!() }
        async fn commit(self: Box<Self>) -> RefdataResult<()> { Ok(()) }
    }

    #[test]
    fn test_merge_source_revision_never_decreases() {
        assert_eq!(merge_source_revision(Some(5), Some(3)), Some(5));
        assert_eq!(merge_source_revision(Some(5), Some(9)), Some(9));
        assert_eq!(merge_source_revision(Some(5), None), Some(5));
        assert_eq!(merge_source_revision(None, Some(2)), Some(2));
        assert_eq!(merge_source_revision(None, None), None);
    }

    #[test]
    fn test_stale_revision_rules() {
        let meta = DictionaryMeta {
            tenant_id: "t".to_string(),
            dict_code: "D".to_string(),
            version: 4,
            last_source_revision: Some(10),
            updated_at: Utc::now(),
        };
        assert!(is_stale_revision(Some(&meta), Some(10)));
        assert!(is_stale_revision(Some(&meta), Some(9)));
        assert!(!is_stale_revision(Some(&meta), Some(11)));
        assert!(!is_stale_revision(Some(&meta), None));
        assert!(!is_stale_revision(None, Some(1)));
    }

    #[tokio::test]
    async fn test_allocation_is_gapless_from_one() {
        let store = InMemoryPlatformStore::new();
        let mut tx = store.begin().await.unwrap();
        for expected in 1..=5 {
            let v = allocate_next_version(tx.as_mut(), "t", "D", None).await.unwrap();
            assert_eq!(v, expected);
        }
        assert_eq!(current_committed_version(tx.as_mut(), "t", "D").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_allocation_merges_source_revision() {
        let store = InMemoryPlatformStore::new();
        let mut tx = store.begin().await.unwrap();
        allocate_next_version(tx.as_mut(), "t", "D", Some(7)).await.unwrap();
        allocate_next_version(tx.as_mut(), "t", "D", None).await.unwrap();
        allocate_next_version(tx.as_mut(), "t", "D", Some(3)).await.unwrap();
        assert_eq!(last_source_revision(tx.as_mut(), "t", "D").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_lost_insert_race_retries_increment() {
        let mut tx = ScriptedTx {
            increments: VecDeque::from(vec![None, Some(2)]),
            inserts: VecDeque::from(vec![false]),
            increment_calls: 0,
        };
        let v = allocate_next_version(&mut tx, "t", "D", None).await.unwrap();
        assert_eq!(v, 2);
        assert_eq!(tx.increment_calls, 2);
    }

    #[tokio::test]
    async fn test_allocation_exhausts_after_bounded_attempts() {
        let mut tx = ScriptedTx {
            increments: VecDeque::new(),
            inserts: VecDeque::new(),
            increment_calls: 0,
        };
        let err = allocate_next_version(&mut tx, "t", "D", None).await.unwrap_err();
        assert_eq!(
            err,
            RefdataError::Storage(StorageError::VersionAllocationExhausted {
                tenant_id: "t".to_string(),
                dict_code: "D".to_string(),
                attempts: MAX_ALLOCATION_ATTEMPTS,
            })
        );
        assert_eq!(tx.increment_calls, MAX_ALLOCATION_ATTEMPTS);
    }
}
