//! Update submission service
//!
//! Validates incoming commands, records them as PENDING and hands them to
//! the apply pipeline. WAIT_COMMIT submissions then wait, up to a deadline,
//! for the request to settle.

use crate::publisher::CommandPublisher;
use refdata_core::constants::{SOURCE_API, SOURCE_EXTERNAL, UNKNOWN_ERROR_MESSAGE};
use refdata_core::wire::decode_command;
use refdata_core::{
    new_event_id, ApplyError, ConsistencyConfig, ConsistencyMode, DictionaryRegistry, EventId,
    NotFoundError, RefdataResult, UpdateCommand, UpdateRequest, UpdateStatus, Version,
};
use refdata_storage::PlatformStore;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// A command plus how long the caller is willing to wait for it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSubmission {
    pub command: UpdateCommand,
    pub mode: ConsistencyMode,
}

impl UpdateSubmission {
    pub fn new(command: UpdateCommand, mode: ConsistencyMode) -> Self {
        Self { command, mode }
    }

    pub fn fire_and_forget(command: UpdateCommand) -> Self {
        Self::new(command, ConsistencyMode::Async)
    }

    pub fn wait_commit(command: UpdateCommand) -> Self {
        Self::new(command, ConsistencyMode::WaitCommit)
    }
}

/// Returned to the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub event_id: EventId,
    pub status: UpdateStatus,
    pub committed_version: Option<Version>,
}

impl SubmissionReceipt {
    fn from_request(request: &UpdateRequest) -> Self {
        Self {
            event_id: request.event_id.clone(),
            status: request.status,
            committed_version: request.committed_version,
        }
    }
}

pub struct UpdateCommandService {
    store: Arc<dyn PlatformStore>,
    registry: Arc<DictionaryRegistry>,
    publisher: Arc<dyn CommandPublisher>,
    /// Fired by the apply side whenever a request settles
    settled: Arc<Notify>,
    config: ConsistencyConfig,
}

impl UpdateCommandService {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        registry: Arc<DictionaryRegistry>,
        publisher: Arc<dyn CommandPublisher>,
        settled: Arc<Notify>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            settled,
            config,
        }
    }

    /// Accept a command from the API edge.
    ///
    /// Validation and registry failures are returned before any state is
    /// created. ASYNC returns the request's status right after it was
    /// published; WAIT_COMMIT waits for it to settle and returns PENDING if
    /// the deadline passes first.
    pub async fn submit(&self, submission: UpdateSubmission) -> RefdataResult<SubmissionReceipt> {
        let UpdateSubmission { mut command, mode } = submission;
        command.validate()?;
        command.dict_code = self.registry.canonical_code(&command.dict_code)?;
        if command.event_id.trim().is_empty() {
            command.event_id = new_event_id();
        }
        command.source = SOURCE_API.to_string();

        let request = self.accept(command).await?;
        match mode {
            ConsistencyMode::Async => Ok(SubmissionReceipt::from_request(&request)),
            ConsistencyMode::WaitCommit => {
                self.wait_for_commit(&request.tenant_id, &request.event_id)
                    .await
            }
        }
    }

    /// Accept a JSON-encoded command arriving from an upstream source.
    pub async fn ingest_external(&self, payload: &str) -> RefdataResult<EventId> {
        let mut command = match decode_command(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable external command");
                return Err(e);
            }
        };
        command.validate()?;
        command.dict_code = self.registry.canonical_code(&command.dict_code)?;
        if command.event_id.trim().is_empty() {
            command.event_id = new_event_id();
        }
        command.source = SOURCE_EXTERNAL.to_string();

        let request = self.accept(command).await?;
        Ok(request.event_id)
    }

    /// Create the PENDING row, then publish. Returns the row as stored.
    async fn accept(&self, command: UpdateCommand) -> RefdataResult<UpdateRequest> {
        let pending = UpdateRequest::pending(&command);
        let mut tx = self.store.begin().await?;
        let created = tx.create_update_request_if_absent(&pending).await?;
        let request = if created {
            pending
        } else {
            tx.find_update_request(&command.tenant_id, &command.event_id)
                .await?
                .unwrap_or(pending)
        };
        tx.commit().await?;

        info!(
            tenant_id = %command.tenant_id,
            event_id = %command.event_id,
            dict_code = %command.dict_code,
            event_type = %command.event_type,
            source = %command.source,
            items = command.items.len(),
            resubmitted = !created,
            "Update accepted"
        );
        self.publisher.publish(command).await?;
        Ok(request)
    }

    /// Current state of an update request.
    pub async fn status(&self, tenant_id: &str, event_id: &str) -> RefdataResult<UpdateRequest> {
        self.store
            .find_update_request(tenant_id, event_id)
            .await?
            .ok_or_else(|| {
                NotFoundError::UpdateRequest {
                    tenant_id: tenant_id.to_string(),
                    event_id: event_id.to_string(),
                }
                .into()
            })
    }

    /// Wait until the request settles or `wait_commit_timeout` passes.
    ///
    /// Wakes on every settle signal and on a short poll tick, so a missed
    /// signal costs at most one tick.
    async fn wait_for_commit(
        &self,
        tenant_id: &str,
        event_id: &str,
    ) -> RefdataResult<SubmissionReceipt> {
        let deadline = Instant::now() + self.config.wait_commit_timeout;
        loop {
            let settled = self.settled.notified();
            let request = self.status(tenant_id, event_id).await?;
            match request.status {
                UpdateStatus::Committed => return Ok(SubmissionReceipt::from_request(&request)),
                UpdateStatus::Failed => {
                    return Err(ApplyError::UpdateFailed {
                        event_id: request.event_id,
                        message: request
                            .error_message
                            .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string()),
                    }
                    .into());
                }
                UpdateStatus::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(tenant_id, event_id, "WAIT_COMMIT deadline passed, returning PENDING");
                return Ok(SubmissionReceipt::from_request(&request));
            }
            let tick = self.config.commit_poll_interval.min(deadline - now);
            let _ = timeout(tick, settled).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refdata_core::{
        DictionaryConfig, EventType, RefdataError, UpdateItem, ValidationError,
    };
    use refdata_storage::InMemoryPlatformStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Publisher that only records what it was given.
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<UpdateCommand>>,
    }

    #[async_trait]
    impl CommandPublisher for RecordingPublisher {
        async fn publish(&self, command: UpdateCommand) -> RefdataResult<()> {
            self.published.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn setup(wait: Duration) -> (InMemoryPlatformStore, Arc<RecordingPublisher>, UpdateCommandService) {
        let store = InMemoryPlatformStore::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let registry = Arc::new(DictionaryRegistry::new(&[DictionaryConfig::enabled("COUNTRY")]));
        let service = UpdateCommandService::new(
            Arc::new(store.clone()),
            registry,
            publisher.clone(),
            Arc::new(Notify::new()),
            ConsistencyConfig {
                wait_commit_timeout: wait,
                commit_poll_interval: Duration::from_millis(5),
            },
        );
        (store, publisher, service)
    }

    #[tokio::test]
    async fn test_async_submit_records_pending_and_publishes() {
        let (store, publisher, service) = setup(Duration::from_millis(50));
        let cmd = UpdateCommand::delta("t1", "country", vec![UpdateItem::upsert("RU", json!(1))])
            .with_event_id("");

        let receipt = service
            .submit(UpdateSubmission::fire_and_forget(cmd))
            .await
            .unwrap();
        assert_eq!(receipt.status, UpdateStatus::Pending);
        assert!(!receipt.event_id.is_empty());
        assert_eq!(receipt.committed_version, None);

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].dict_code, "COUNTRY");
        assert_eq!(published[0].source, SOURCE_API);
        assert_eq!(published[0].event_id, receipt.event_id);

        let request = store
            .find_update_request("t1", &receipt.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.status, UpdateStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_dictionary_rejected_without_state() {
        let (store, publisher, service) = setup(Duration::from_millis(50));
        let cmd = UpdateCommand::delta("t1", "PLANET", vec![]).with_event_id("e-1");
        let err = service
            .submit(UpdateSubmission::fire_and_forget(cmd))
            .await
            .unwrap_err();
        assert!(matches!(err, RefdataError::NotFound(NotFoundError::Dictionary { .. })));
        assert!(store.find_update_request("t1", "e-1").await.unwrap().is_none());
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_chunk_metadata_rejected() {
        let (_store, _publisher, service) = setup(Duration::from_millis(50));
        let cmd = UpdateCommand::snapshot("t1", "COUNTRY", vec![]).with_chunk("s-1", 3, 2);
        let err = service
            .submit(UpdateSubmission::fire_and_forget(cmd))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RefdataError::Validation(ValidationError::InvalidChunkMetadata { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_commit_times_out_as_pending() {
        let (_store, _publisher, service) = setup(Duration::from_millis(30));
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![]).with_event_id("e-1");
        let started = Instant::now();
        let receipt = service
            .submit(UpdateSubmission::wait_commit(cmd))
            .await
            .unwrap();
        assert_eq!(receipt.status, UpdateStatus::Pending);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_commit_surfaces_failure() {
        let (store, _publisher, service) = setup(Duration::from_millis(200));
        let cmd = UpdateCommand::delta("t1", "COUNTRY", vec![]).with_event_id("e-1");
        let failing_store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut tx = failing_store.begin().await.unwrap();
            tx.mark_update_failed("t1", "e-1", "Stale sourceRevision")
                .await
                .unwrap();
            tx.commit().await.unwrap();
        });

        let err = service
            .submit(UpdateSubmission::wait_commit(cmd))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RefdataError::Apply(ApplyError::UpdateFailed {
                event_id: "e-1".to_string(),
                message: "Stale sourceRevision".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_ingest_external_normalizes_source() {
        let (_store, publisher, service) = setup(Duration::from_millis(50));
        let payload = r#"{
            "eventId": "ext-1",
            "tenantId": "t1",
            "source": "upstream-feed",
            "dictCode": "country",
            "eventType": "DELTA",
            "items": [{"key": "RU", "op": "UPSERT", "payload": {"name": "Russia"}}]
        }"#;

        let event_id = service.ingest_external(payload).await.unwrap();
        assert_eq!(event_id, "ext-1");
        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published[0].source, SOURCE_EXTERNAL);
        assert_eq!(published[0].dict_code, "COUNTRY");
        assert_eq!(published[0].event_type, EventType::Delta);
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_payload() {
        let (_store, publisher, service) = setup(Duration::from_millis(50));
        let err = service.ingest_external("{not json").await.unwrap_err();
        assert!(matches!(err, RefdataError::Validation(ValidationError::MalformedPayload { .. })));
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_of_unknown_request_is_not_found() {
        let (_store, _publisher, service) = setup(Duration::from_millis(50));
        let err = service.status("t1", "missing").await.unwrap_err();
        assert!(matches!(err, RefdataError::NotFound(NotFoundError::UpdateRequest { .. })));
    }
}
