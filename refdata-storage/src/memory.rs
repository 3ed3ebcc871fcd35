//! In-memory reference implementation of the durable store.
//!
//! A transaction holds the store lock for its whole lifetime and works on a
//! private copy of the state; commit swaps the copy in, drop discards it.
//! Transactions are therefore fully serialized, which is stronger than the
//! row-level atomicity the apply pipeline actually needs.

use crate::repository::merge_source_revision;
use crate::store::{PlatformStore, PlatformTx};
use async_trait::async_trait;
use chrono::Utc;
use refdata_core::{
    ClaimOutcome, DictionaryMeta, ItemMap, NewOutboxEvent, OutboxEvent, ProcessedEvent,
    RefdataResult, SnapshotChunk, StorageError, UpdateItem, UpdateRequest, UpdateStatus, Version,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type PairKey = (String, String);
type ChunkKey = (String, String, String);

fn pair(a: &str, b: &str) -> PairKey {
    (a.to_string(), b.to_string())
}

/// One materialized item with the version that last wrote it.
#[derive(Debug, Clone, PartialEq)]
struct StoredItem {
    payload: Value,
    version: Version,
}

#[derive(Debug, Clone, Default)]
struct PlatformState {
    update_requests: HashMap<PairKey, UpdateRequest>,
    processed_events: HashMap<PairKey, ProcessedEvent>,
    meta: HashMap<PairKey, DictionaryMeta>,
    chunks: HashMap<ChunkKey, BTreeMap<u32, SnapshotChunk>>,
    outbox: BTreeMap<i64, OutboxEvent>,
    next_outbox_id: i64,
    items: HashMap<PairKey, BTreeMap<String, StoredItem>>,
}

impl PlatformState {
    fn items_of(&self, tenant_id: &str, dict_code: &str) -> ItemMap {
        self.items
            .get(&pair(tenant_id, dict_code))
            .map(|items| {
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn transition(
        &mut self,
        tenant_id: &str,
        event_id: &str,
        status: UpdateStatus,
        version: Option<Version>,
        message: Option<&str>,
    ) -> bool {
        match self.update_requests.get_mut(&pair(tenant_id, event_id)) {
            Some(req) if req.status == UpdateStatus::Pending => {
                req.status = status;
                req.committed_version = version;
                req.error_message = message.map(str::to_string);
                req.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

/// Transactional in-memory store.
#[derive(Debug, Clone)]
pub struct InMemoryPlatformStore {
    state: Arc<Mutex<PlatformState>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryPlatformStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryPlatformStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StorageError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> RefdataResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            }
            .into())
        }
    }

    /// Number of outbox rows not yet published.
    pub async fn unpublished_outbox_count(&self) -> usize {
        self.state
            .lock()
            .await
            .outbox
            .values()
            .filter(|row| !row.published)
            .count()
    }

    /// Number of chunk rows currently held for a snapshot.
    pub async fn pending_chunk_count(&self, tenant_id: &str, dict_code: &str, snapshot_id: &str) -> usize {
        let key = (tenant_id.to_string(), dict_code.to_string(), snapshot_id.to_string());
        self.state
            .lock()
            .await
            .chunks
            .get(&key)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl PlatformStore for InMemoryPlatformStore {
    async fn begin(&self) -> RefdataResult<Box<dyn PlatformTx>> {
        self.check_available()?;
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            working,
            available: Arc::clone(&self.available),
        }))
    }

    async fn find_update_request(
        &self,
        tenant_id: &str,
        event_id: &str,
    ) -> RefdataResult<Option<UpdateRequest>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.update_requests.get(&pair(tenant_id, event_id)).cloned())
    }

    async fn dictionary_meta(
        &self,
        tenant_id: &str,
        dict_code: &str,
    ) -> RefdataResult<Option<DictionaryMeta>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.meta.get(&pair(tenant_id, dict_code)).cloned())
    }

    async fn load_items(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<ItemMap> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.items_of(tenant_id, dict_code))
    }

    async fn fetch_unpublished_outbox(&self, limit: usize) -> RefdataResult<Vec<OutboxEvent>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|row| !row.published)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_outbox_published(&self, id: i64) -> RefdataResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(&id) {
            Some(row) => {
                row.published = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Open transaction over [`InMemoryPlatformStore`].
struct InMemoryTx {
    guard: OwnedMutexGuard<PlatformState>,
    working: PlatformState,
    available: Arc<AtomicBool>,
}

#[async_trait]
impl PlatformTx for InMemoryTx {
    async fn create_update_request_if_absent(
        &mut self,
        request: &UpdateRequest,
    ) -> RefdataResult<bool> {
        let key = pair(&request.tenant_id, &request.event_id);
        if self.working.update_requests.contains_key(&key) {
            return Ok(false);
        }
        self.working.update_requests.insert(key, request.clone());
        Ok(true)
    }

    async fn find_update_request(
        &mut self,
        tenant_id: &str,
        event_id: &str,
    ) -> RefdataResult<Option<UpdateRequest>> {
        Ok(self
            .working
            .update_requests
            .get(&pair(tenant_id, event_id))
            .cloned())
    }

    async fn mark_update_committed(
        &mut self,
        tenant_id: &str,
        event_id: &str,
        version: Version,
    ) -> RefdataResult<bool> {
        Ok(self
            .working
            .transition(tenant_id, event_id, UpdateStatus::Committed, Some(version), None))
    }

    async fn mark_snapshot_committed(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
        version: Version,
    ) -> RefdataResult<u64> {
        let now = Utc::now();
        let mut updated = 0;
        for req in self.working.update_requests.values_mut() {
            if req.tenant_id == tenant_id
                && req.dict_code == dict_code
                && req.snapshot_id.as_deref() == Some(snapshot_id)
                && req.status == UpdateStatus::Pending
            {
                req.status = UpdateStatus::Committed;
                req.committed_version = Some(version);
                req.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_update_failed(
        &mut self,
        tenant_id: &str,
        event_id: &str,
        message: &str,
    ) -> RefdataResult<bool> {
        Ok(self
            .working
            .transition(tenant_id, event_id, UpdateStatus::Failed, None, Some(message)))
    }

    async fn claim_event(
        &mut self,
        tenant_id: &str,
        event_id: &str,
    ) -> RefdataResult<ClaimOutcome> {
        let key = pair(tenant_id, event_id);
        if self.working.processed_events.contains_key(&key) {
            return Ok(ClaimOutcome::AlreadyProcessed);
        }
        self.working.processed_events.insert(
            key,
            ProcessedEvent {
                tenant_id: tenant_id.to_string(),
                event_id: event_id.to_string(),
                processed_at: Utc::now(),
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn dictionary_meta(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
    ) -> RefdataResult<Option<DictionaryMeta>> {
        Ok(self.working.meta.get(&pair(tenant_id, dict_code)).cloned())
    }

    async fn increment_meta(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        source_revision: Option<i64>,
    ) -> RefdataResult<Option<Version>> {
        match self.working.meta.get_mut(&pair(tenant_id, dict_code)) {
            Some(meta) => {
                meta.version += 1;
                meta.last_source_revision =
                    merge_source_revision(meta.last_source_revision, source_revision);
                meta.updated_at = Utc::now();
                Ok(Some(meta.version))
            }
            None => Ok(None),
        }
    }

    async fn insert_meta_if_absent(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        source_revision: Option<i64>,
    ) -> RefdataResult<bool> {
        let key = pair(tenant_id, dict_code);
        if self.working.meta.contains_key(&key) {
            return Ok(false);
        }
        self.working.meta.insert(
            key,
            DictionaryMeta {
                tenant_id: tenant_id.to_string(),
                dict_code: dict_code.to_string(),
                version: 1,
                last_source_revision: source_revision,
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn insert_outbox_event(&mut self, event: &NewOutboxEvent) -> RefdataResult<i64> {
        self.working.next_outbox_id += 1;
        let id = self.working.next_outbox_id;
        self.working.outbox.insert(
            id,
            OutboxEvent {
                id,
                tenant_id: event.tenant_id.clone(),
                event_id: event.event_id.clone(),
                dict_code: event.dict_code.clone(),
                version: event.version,
                payload: event.payload.clone(),
                published: false,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn save_snapshot_chunk(&mut self, chunk: &SnapshotChunk) -> RefdataResult<()> {
        let key = (
            chunk.tenant_id.clone(),
            chunk.dict_code.clone(),
            chunk.snapshot_id.clone(),
        );
        self.working
            .chunks
            .entry(key)
            .or_default()
            .insert(chunk.chunk_index, chunk.clone());
        Ok(())
    }

    async fn count_snapshot_chunks(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
    ) -> RefdataResult<u32> {
        let key = (tenant_id.to_string(), dict_code.to_string(), snapshot_id.to_string());
        let count = self.working.chunks.get(&key).map(BTreeMap::len).unwrap_or(0);
        u32::try_from(count).map_err(|_| {
            StorageError::Corrupted {
                table: "snapshot_chunk".to_string(),
                reason: format!("chunk count {} overflows u32", count),
            }
            .into()
        })
    }

    async fn load_snapshot_items(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
    ) -> RefdataResult<Vec<UpdateItem>> {
        let key = (tenant_id.to_string(), dict_code.to_string(), snapshot_id.to_string());
        Ok(self
            .working
            .chunks
            .get(&key)
            .map(|chunks| {
                chunks
                    .values()
                    .flat_map(|chunk| chunk.items.iter().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear_snapshot_chunks(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
    ) -> RefdataResult<u64> {
        let key = (tenant_id.to_string(), dict_code.to_string(), snapshot_id.to_string());
        Ok(self
            .working
            .chunks
            .remove(&key)
            .map(|chunks| chunks.len() as u64)
            .unwrap_or(0))
    }

    async fn upsert_item(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        key: &str,
        payload: &Value,
        version: Version,
    ) -> RefdataResult<()> {
        self.working
            .items
            .entry(pair(tenant_id, dict_code))
            .or_default()
            .insert(
                key.to_string(),
                StoredItem {
                    payload: payload.clone(),
                    version,
                },
            );
        Ok(())
    }

    async fn delete_item(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        key: &str,
    ) -> RefdataResult<bool> {
        Ok(self
            .working
            .items
            .get_mut(&pair(tenant_id, dict_code))
            .map(|items| items.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn clear_items(&mut self, tenant_id: &str, dict_code: &str) -> RefdataResult<u64> {
        Ok(self
            .working
            .items
            .remove(&pair(tenant_id, dict_code))
            .map(|items| items.len() as u64)
            .unwrap_or(0))
    }

    async fn load_items(&mut self, tenant_id: &str, dict_code: &str) -> RefdataResult<ItemMap> {
        Ok(self.working.items_of(tenant_id, dict_code))
    }

    async fn commit(self: Box<Self>) -> RefdataResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionFailed {
                reason: "store became unavailable before commit".to_string(),
            }
            .into());
        }
        let InMemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}
