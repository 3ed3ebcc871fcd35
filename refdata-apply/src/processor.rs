//! Apply processor
//!
//! Turns one [`UpdateCommand`] into durable, versioned dictionary state.
//! Every step of a pass runs inside a single store transaction: the request
//! row, the idempotency claim, the version bump, the item mutation and the
//! outbox row commit together or not at all.

use refdata_core::constants::{STALE_REVISION_MESSAGE, UNKNOWN_ERROR_MESSAGE};
use refdata_core::{
    ApplyOutcome, ClaimOutcome, DictionaryRegistry, InvalidationEvent, RefdataResult,
    SnapshotChunk, UpdateCommand, UpdateRequest, ValidationError, Version,
};
use refdata_storage::{
    allocate_next_version, insert_outbox_event, is_stale_revision, PlatformStore, PlatformTx,
    ProviderRouter,
};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Applies update commands against the durable store.
pub struct ApplyProcessor {
    store: Arc<dyn PlatformStore>,
    registry: Arc<DictionaryRegistry>,
    providers: ProviderRouter,
    /// Woken whenever an update request reaches a terminal state
    settled: Arc<Notify>,
}

impl ApplyProcessor {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        registry: Arc<DictionaryRegistry>,
        providers: ProviderRouter,
    ) -> Self {
        Self {
            store,
            registry,
            providers,
            settled: Arc::new(Notify::new()),
        }
    }

    /// Signal fired after every COMMITTED or FAILED transition.
    pub fn settled_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.settled)
    }

    /// The command with its dictionary code in configured spelling.
    fn canonical<'a>(&self, command: &'a UpdateCommand) -> RefdataResult<Cow<'a, UpdateCommand>> {
        let dict_code = self.registry.canonical_code(&command.dict_code)?;
        if dict_code == command.dict_code {
            return Ok(Cow::Borrowed(command));
        }
        let mut owned = command.clone();
        owned.dict_code = dict_code;
        Ok(Cow::Owned(owned))
    }

    /// Run one apply pass.
    ///
    /// Unknown dictionaries are rejected before any state is created.
    /// Duplicates and stale revisions are outcomes, not errors. Any error
    /// rolls the whole pass back.
    pub async fn process(&self, command: &UpdateCommand) -> RefdataResult<ApplyOutcome> {
        let canonical = self.canonical(command)?;
        let command: &UpdateCommand = &canonical;
        let tenant_id = command.tenant_id.as_str();
        let event_id = command.event_id.as_str();
        let dict_code = command.dict_code.as_str();

        let mut tx = self.store.begin().await?;
        let created = tx
            .create_update_request_if_absent(&UpdateRequest::pending(command))
            .await?;

        // A request settled by the fail path carries no claim; it must not
        // be applied on redelivery.
        if !created {
            if let Some(request) = tx.find_update_request(tenant_id, event_id).await? {
                if request.is_terminal() {
                    debug!(
                        tenant_id,
                        event_id,
                        dict_code,
                        status = %request.status,
                        "Event already settled, ignoring redelivery"
                    );
                    return Ok(ApplyOutcome::Duplicate);
                }
            }
        }

        if tx.claim_event(tenant_id, event_id).await? == ClaimOutcome::AlreadyProcessed {
            debug!(tenant_id, event_id, dict_code, "Duplicate event ignored");
            return Ok(ApplyOutcome::Duplicate);
        }

        let meta = tx.dictionary_meta(tenant_id, dict_code).await?;
        if is_stale_revision(meta.as_ref(), command.source_revision) {
            tx.mark_update_failed(tenant_id, event_id, STALE_REVISION_MESSAGE)
                .await?;
            tx.commit().await?;
            self.settled.notify_waiters();
            warn!(
                tenant_id,
                event_id,
                dict_code,
                source_revision = ?command.source_revision,
                last_source_revision = ?meta.and_then(|m| m.last_source_revision),
                "Rejected stale source revision"
            );
            return Ok(ApplyOutcome::StaleRevision);
        }

        let outcome = if command.is_chunked_snapshot() {
            self.apply_chunk(tx.as_mut(), command).await?
        } else {
            self.apply_whole(tx.as_mut(), command).await?
        };
        tx.commit().await?;

        match outcome {
            ApplyOutcome::Committed { version } => {
                self.settled.notify_waiters();
                info!(
                    tenant_id,
                    event_id,
                    dict_code,
                    event_type = %command.event_type,
                    version,
                    "Update committed"
                );
            }
            ApplyOutcome::AwaitingChunks { received, total } => {
                debug!(
                    tenant_id,
                    event_id,
                    dict_code,
                    snapshot_id = ?command.snapshot_id,
                    received,
                    total,
                    "Snapshot chunk stored"
                );
            }
            ApplyOutcome::Duplicate | ApplyOutcome::StaleRevision => {}
        }
        Ok(outcome)
    }

    /// DELTA, or a SNAPSHOT delivered in one piece.
    async fn apply_whole(
        &self,
        tx: &mut dyn PlatformTx,
        command: &UpdateCommand,
    ) -> RefdataResult<ApplyOutcome> {
        let tenant_id = command.tenant_id.as_str();
        let dict_code = command.dict_code.as_str();
        let version =
            allocate_next_version(tx, tenant_id, dict_code, command.source_revision).await?;

        let provider = self.providers.for_dictionary(dict_code);
        if command.is_snapshot() {
            provider
                .apply_snapshot(tx, tenant_id, dict_code, &command.items, command, version)
                .await?;
        } else {
            provider
                .apply_delta(tx, tenant_id, dict_code, &command.items, command, version)
                .await?;
        }

        tx.mark_update_committed(tenant_id, &command.event_id, version)
            .await?;
        self.write_outbox(tx, command, version).await?;
        Ok(ApplyOutcome::Committed { version })
    }

    /// Store one chunk; apply the snapshot once every chunk has arrived.
    async fn apply_chunk(
        &self,
        tx: &mut dyn PlatformTx,
        command: &UpdateCommand,
    ) -> RefdataResult<ApplyOutcome> {
        let chunk = SnapshotChunk::from_command(command).ok_or_else(|| {
            ValidationError::InvalidChunkMetadata {
                reason: "chunked snapshot requires snapshotId, chunkIndex and chunksTotal"
                    .to_string(),
            }
        })?;
        let tenant_id = chunk.tenant_id.as_str();
        let dict_code = chunk.dict_code.as_str();
        let snapshot_id = chunk.snapshot_id.as_str();

        tx.save_snapshot_chunk(&chunk).await?;
        let received = tx
            .count_snapshot_chunks(tenant_id, dict_code, snapshot_id)
            .await?;
        if received < chunk.chunks_total {
            return Ok(ApplyOutcome::AwaitingChunks {
                received,
                total: chunk.chunks_total,
            });
        }

        let items = tx
            .load_snapshot_items(tenant_id, dict_code, snapshot_id)
            .await?;
        let version =
            allocate_next_version(tx, tenant_id, dict_code, command.source_revision).await?;
        self.providers
            .for_dictionary(dict_code)
            .apply_snapshot(tx, tenant_id, dict_code, &items, command, version)
            .await?;
        tx.clear_snapshot_chunks(tenant_id, dict_code, snapshot_id)
            .await?;
        let settled = tx
            .mark_snapshot_committed(tenant_id, dict_code, snapshot_id, version)
            .await?;
        debug!(
            tenant_id,
            dict_code,
            snapshot_id,
            chunks = chunk.chunks_total,
            items = items.len(),
            requests = settled,
            "Chunked snapshot assembled"
        );
        self.write_outbox(tx, command, version).await?;
        Ok(ApplyOutcome::Committed { version })
    }

    async fn write_outbox(
        &self,
        tx: &mut dyn PlatformTx,
        command: &UpdateCommand,
        version: Version,
    ) -> RefdataResult<()> {
        let event = InvalidationEvent::new(
            command.event_id.clone(),
            command.tenant_id.clone(),
            command.dict_code.clone(),
            version,
        );
        insert_outbox_event(tx, &event).await?;
        Ok(())
    }

    /// Record a failed apply in its own short transaction.
    ///
    /// Creates the request row if it is missing, then marks it FAILED. Does
    /// nothing for unregistered dictionaries. A blank message is recorded as
    /// "Unknown error".
    pub async fn fail(&self, command: &UpdateCommand, message: &str) -> RefdataResult<()> {
        let Ok(command) = self.canonical(command) else {
            debug!(
                tenant_id = %command.tenant_id,
                event_id = %command.event_id,
                dict_code = %command.dict_code,
                "Not recording failure for unregistered dictionary"
            );
            return Ok(());
        };
        let message = if message.trim().is_empty() {
            UNKNOWN_ERROR_MESSAGE
        } else {
            message
        };

        let mut tx = self.store.begin().await?;
        tx.create_update_request_if_absent(&UpdateRequest::pending(&command))
            .await?;
        let marked = tx
            .mark_update_failed(&command.tenant_id, &command.event_id, message)
            .await?;
        tx.commit().await?;

        if marked {
            self.settled.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdata_core::{DictionaryConfig, NotFoundError, RefdataError, UpdateItem, UpdateStatus};
    use refdata_storage::{GenericItemProvider, InMemoryPlatformStore};
    use serde_json::json;

    fn setup() -> (InMemoryPlatformStore, ApplyProcessor) {
        let store = InMemoryPlatformStore::new();
        let shared: Arc<dyn PlatformStore> = Arc::new(store.clone());
        let registry = Arc::new(DictionaryRegistry::new(&[DictionaryConfig::enabled(
            "COUNTRY",
        )]));
        let providers = ProviderRouter::new(Arc::new(GenericItemProvider::new(Arc::clone(&shared))));
        (store, ApplyProcessor::new(shared, registry, providers))
    }

    async fn status(store: &InMemoryPlatformStore, event_id: &str) -> UpdateRequest {
        store.find_update_request("t1", event_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_delta_commits_version_and_outbox() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![UpdateItem::upsert("RU", json!({"name": "Russia"}))])
            .with_event_id("e-1");

        let outcome = processor.process(&cmd).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Committed { version: 1 });

        let request = status(&store, "e-1").await;
        assert_eq!(request.status, UpdateStatus::Committed);
        assert_eq!(request.committed_version, Some(1));
        assert_eq!(store.unpublished_outbox_count().await, 1);
        assert_eq!(store.load_items("t1", "COUNTRY").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_noop() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![UpdateItem::upsert("RU", json!(1))])
            .with_event_id("e-1");

        processor.process(&cmd).await.unwrap();
        assert_eq!(processor.process(&cmd).await.unwrap(), ApplyOutcome::Duplicate);

        let meta = store.dictionary_meta("t1", "COUNTRY").await.unwrap().unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(store.unpublished_outbox_count().await, 1);
    }

    #[tokio::test]
    async fn test_dictionary_code_is_canonicalized() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "country", vec![UpdateItem::upsert("RU", json!(1))]);
        processor.process(&cmd).await.unwrap();
        assert!(store.dictionary_meta("t1", "COUNTRY").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_dictionary_creates_no_state() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "PLANET", vec![]).with_event_id("e-1");

        let err = processor.process(&cmd).await.unwrap_err();
        assert!(matches!(err, RefdataError::NotFound(NotFoundError::Dictionary { .. })));

        processor.fail(&cmd, "boom").await.unwrap();
        assert!(store.find_update_request("t1", "e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_revision_marks_failed() {
        let (store, processor) = setup();
        let first = UpdateCommand::delta("t1", "COUNTRY", vec![UpdateItem::upsert("RU", json!(1))])
            .with_source_revision(5);
        processor.process(&first).await.unwrap();

        let stale = UpdateCommand::delta("t1", "COUNTRY", vec![UpdateItem::upsert("RU", json!(2))])
            .with_event_id("e-stale")
            .with_source_revision(5);
        assert_eq!(processor.process(&stale).await.unwrap(), ApplyOutcome::StaleRevision);

        let request = status(&store, "e-stale").await;
        assert_eq!(request.status, UpdateStatus::Failed);
        assert_eq!(request.error_message.as_deref(), Some(STALE_REVISION_MESSAGE));
        assert_eq!(store.dictionary_meta("t1", "COUNTRY").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_chunked_snapshot_commits_after_last_chunk() {
        let (store, processor) = setup();
        let chunk = |idx: u32, key: &str| {
            UpdateCommand::snapshot("t1", "COUNTRY", vec![UpdateItem::upsert(key, json!(idx))])
                .with_event_id(format!("e-{idx}"))
                .with_chunk("snap-1", idx, 2)
        };

        assert_eq!(
            processor.process(&chunk(2, "US")).await.unwrap(),
            ApplyOutcome::AwaitingChunks { received: 1, total: 2 }
        );
        assert_eq!(status(&store, "e-2").await.status, UpdateStatus::Pending);

        assert_eq!(
            processor.process(&chunk(1, "RU")).await.unwrap(),
            ApplyOutcome::Committed { version: 1 }
        );
        for event_id in ["e-1", "e-2"] {
            let request = status(&store, event_id).await;
            assert_eq!(request.status, UpdateStatus::Committed);
            assert_eq!(request.committed_version, Some(1));
        }
        let items = store.load_items("t1", "COUNTRY").await.unwrap();
        assert_eq!(items.keys().collect::<Vec<_>>(), vec!["RU", "US"]);
        assert_eq!(store.pending_chunk_count("t1", "COUNTRY", "snap-1").await, 0);
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back_and_fail_records_message() {
        let (store, processor) = setup();
        // UPSERT without payload fails inside the provider after allocation.
        let cmd = UpdateCommand::delta(
            "t1",
            "COUNTRY",
            vec![UpdateItem {
                key: "RU".to_string(),
                op: refdata_core::ItemOperation::Upsert,
                payload: None,
            }],
        )
        .with_event_id("e-bad");

        let err = processor.process(&cmd).await.unwrap_err();
        assert!(store.dictionary_meta("t1", "COUNTRY").await.unwrap().is_none());
        assert!(store.find_update_request("t1", "e-bad").await.unwrap().is_none());

        processor.fail(&cmd, &err.to_string()).await.unwrap();
        let request = status(&store, "e-bad").await;
        assert_eq!(request.status, UpdateStatus::Failed);
        assert_eq!(request.error_message, Some(err.to_string()));
    }

    #[tokio::test]
    async fn test_fail_with_blank_message_records_unknown_error() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![]).with_event_id("e-1");
        processor.fail(&cmd, "  ").await.unwrap();
        assert_eq!(
            status(&store, "e-1").await.error_message.as_deref(),
            Some(UNKNOWN_ERROR_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_fail_never_reopens_committed_request() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![UpdateItem::upsert("RU", json!(1))])
            .with_event_id("e-1");
        processor.process(&cmd).await.unwrap();
        processor.fail(&cmd, "late failure").await.unwrap();
        assert_eq!(status(&store, "e-1").await.status, UpdateStatus::Committed);
    }

    #[tokio::test]
    async fn test_redelivery_after_fail_applies_nothing() {
        let (store, processor) = setup();
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![UpdateItem::upsert("RU", json!(1))])
            .with_event_id("e-1");
        processor.fail(&cmd, "store unavailable").await.unwrap();

        assert_eq!(processor.process(&cmd).await.unwrap(), ApplyOutcome::Duplicate);

        let request = status(&store, "e-1").await;
        assert_eq!(request.status, UpdateStatus::Failed);
        assert_eq!(request.committed_version, None);
        assert!(store.dictionary_meta("t1", "COUNTRY").await.unwrap().is_none());
        assert!(store.load_items("t1", "COUNTRY").await.unwrap().is_empty());
        assert_eq!(store.unpublished_outbox_count().await, 0);
    }
}
