//! Durable store contract.
//!
//! [`PlatformStore`] hands out transactions and serves the few reads that
//! happen outside one (status polling, outbox relay, cache fallback).
//! [`PlatformTx`] carries every mutation of the apply pipeline; nothing is
//! visible to other readers until [`PlatformTx::commit`], and dropping an
//! uncommitted transaction rolls it back.

use async_trait::async_trait;
use refdata_core::{
    ClaimOutcome, DictionaryMeta, ItemMap, NewOutboxEvent, OutboxEvent, RefdataResult,
    SnapshotChunk, UpdateItem, UpdateRequest, Version,
};
use serde_json::Value;

/// Transactional durable store.
#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> RefdataResult<Box<dyn PlatformTx>>;

    /// Read an update request's current state.
    async fn find_update_request(
        &self,
        tenant_id: &str,
        event_id: &str,
    ) -> RefdataResult<Option<UpdateRequest>>;

    /// Read the version row of a dictionary.
    async fn dictionary_meta(
        &self,
        tenant_id: &str,
        dict_code: &str,
    ) -> RefdataResult<Option<DictionaryMeta>>;

    /// Read all materialized items of a dictionary.
    async fn load_items(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<ItemMap>;

    /// Unpublished outbox rows, oldest (lowest id) first.
    async fn fetch_unpublished_outbox(&self, limit: usize) -> RefdataResult<Vec<OutboxEvent>>;

    /// Mark an outbox row published. Returns false if the row does not exist.
    async fn mark_outbox_published(&self, id: i64) -> RefdataResult<bool>;
}

/// One open transaction.
#[async_trait]
pub trait PlatformTx: Send {
    // ========================================================================
    // UPDATE REQUESTS
    // ========================================================================

    /// Insert the row if no row exists for (tenant, event id).
    /// Returns true if it was inserted.
    async fn create_update_request_if_absent(
        &mut self,
        request: &UpdateRequest,
    ) -> RefdataResult<bool>;

    async fn find_update_request(
        &mut self,
        tenant_id: &str,
        event_id: &str,
    ) -> RefdataResult<Option<UpdateRequest>>;

    /// PENDING -> COMMITTED. Terminal rows are left untouched (returns false).
    async fn mark_update_committed(
        &mut self,
        tenant_id: &str,
        event_id: &str,
        version: Version,
    ) -> RefdataResult<bool>;

    /// PENDING -> COMMITTED for every request of one chunked snapshot.
    /// Returns the number of rows transitioned.
    async fn mark_snapshot_committed(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
        version: Version,
    ) -> RefdataResult<u64>;

    /// PENDING -> FAILED. Terminal rows are left untouched (returns false).
    async fn mark_update_failed(
        &mut self,
        tenant_id: &str,
        event_id: &str,
        message: &str,
    ) -> RefdataResult<bool>;

    // ========================================================================
    // IDEMPOTENCY + VERSIONS
    // ========================================================================

    /// Insert-or-ignore into the processed-event ledger.
    async fn claim_event(&mut self, tenant_id: &str, event_id: &str)
        -> RefdataResult<ClaimOutcome>;

    async fn dictionary_meta(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
    ) -> RefdataResult<Option<DictionaryMeta>>;

    /// Atomically bump an existing version row, merging the source revision.
    /// Returns the new version, or `None` if no row exists.
    async fn increment_meta(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        source_revision: Option<i64>,
    ) -> RefdataResult<Option<Version>>;

    /// Insert the version row at version 1 unless one exists.
    /// Returns false when another writer created it first.
    async fn insert_meta_if_absent(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        source_revision: Option<i64>,
    ) -> RefdataResult<bool>;

    // ========================================================================
    // OUTBOX
    // ========================================================================

    /// Returns the assigned, monotonically increasing row id.
    async fn insert_outbox_event(&mut self, event: &NewOutboxEvent) -> RefdataResult<i64>;

    // ========================================================================
    // SNAPSHOT CHUNKS
    // ========================================================================

    /// Save a chunk, replacing an earlier copy with the same index.
    async fn save_snapshot_chunk(&mut self, chunk: &SnapshotChunk) -> RefdataResult<()>;

    async fn count_snapshot_chunks(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
    ) -> RefdataResult<u32>;

    /// Items of all chunks concatenated in chunk-index order.
    async fn load_snapshot_items(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
    ) -> RefdataResult<Vec<UpdateItem>>;

    async fn clear_snapshot_chunks(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        snapshot_id: &str,
    ) -> RefdataResult<u64>;

    // ========================================================================
    // MATERIALIZED ITEMS
    // ========================================================================

    async fn upsert_item(
        &mut self,
        tenant_id: &str,
        dict_code: &str,
        key: &str,
        payload: &Value,
        version: Version,
    ) -> RefdataResult<()>;

    async fn delete_item(&mut self, tenant_id: &str, dict_code: &str, key: &str)
        -> RefdataResult<bool>;

    async fn clear_items(&mut self, tenant_id: &str, dict_code: &str) -> RefdataResult<u64>;

    async fn load_items(&mut self, tenant_id: &str, dict_code: &str) -> RefdataResult<ItemMap>;

    // ========================================================================
    // COMPLETION
    // ========================================================================

    /// Make every change of this transaction visible atomically.
    async fn commit(self: Box<Self>) -> RefdataResult<()>;
}
