//! Persisted records of the apply pipeline and typed pipeline outcomes

use crate::{
    wire, EventId, EventType, InvalidationEvent, RefdataResult, TenantId, Timestamp,
    UpdateCommand, UpdateItem, UpdateStatus, Version,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// UPDATE REQUEST
// ============================================================================

/// Status row tracking one submitted event.
///
/// Created PENDING before dispatch, moved to COMMITTED or FAILED exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub tenant_id: TenantId,
    pub event_id: EventId,
    pub dict_code: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl UpdateRequest {
    /// Fresh PENDING row for a command.
    pub fn pending(command: &UpdateCommand) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: command.tenant_id.clone(),
            event_id: command.event_id.clone(),
            dict_code: command.dict_code.clone(),
            event_type: command.event_type,
            snapshot_id: command.snapshot_id.clone(),
            status: UpdateStatus::Pending,
            committed_version: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// DICTIONARY META / PROCESSED EVENTS / CHUNKS
// ============================================================================

/// Version counter row, one per (tenant, dictionary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryMeta {
    pub tenant_id: TenantId,
    pub dict_code: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_source_revision: Option<i64>,
    pub updated_at: Timestamp,
}

/// Idempotency ledger entry keyed by (tenant, event id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub tenant_id: TenantId,
    pub event_id: EventId,
    pub processed_at: Timestamp,
}

/// One persisted fragment of a chunked snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChunk {
    pub tenant_id: TenantId,
    pub dict_code: String,
    pub snapshot_id: String,
    pub chunk_index: u32,
    pub chunks_total: u32,
    pub items: Vec<UpdateItem>,
    pub created_at: Timestamp,
}

impl SnapshotChunk {
    /// Chunk carried by a chunked snapshot command, `None` otherwise.
    pub fn from_command(command: &UpdateCommand) -> Option<Self> {
        if !command.is_chunked_snapshot() {
            return None;
        }
        Some(Self {
            tenant_id: command.tenant_id.clone(),
            dict_code: command.dict_code.clone(),
            snapshot_id: command.snapshot_id.clone()?,
            chunk_index: command.chunk_index?,
            chunks_total: command.chunks_total?,
            items: command.items.clone(),
            created_at: Utc::now(),
        })
    }
}

// ============================================================================
// OUTBOX
// ============================================================================

/// Outbox row as stored, with its store-assigned monotonic id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub id: i64,
    pub tenant_id: TenantId,
    pub event_id: EventId,
    pub dict_code: String,
    pub version: Version,
    /// Encoded [`InvalidationEvent`].
    pub payload: String,
    pub published: bool,
    pub created_at: Timestamp,
}

impl OutboxEvent {
    pub fn decode_payload(&self) -> RefdataResult<InvalidationEvent> {
        wire::decode_invalidation(&self.payload)
    }
}

/// Outbox row before insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub tenant_id: TenantId,
    pub event_id: EventId,
    pub dict_code: String,
    pub version: Version,
    pub payload: String,
}

impl NewOutboxEvent {
    pub fn from_invalidation(event: &InvalidationEvent) -> RefdataResult<Self> {
        Ok(Self {
            tenant_id: event.tenant_id.clone(),
            event_id: event.event_id.clone(),
            dict_code: event.dict_code.clone(),
            version: event.version,
            payload: wire::encode_invalidation(event)?,
        })
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of inserting into the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First writer; proceed with the apply.
    Claimed,
    /// The event id was already claimed for this tenant.
    AlreadyProcessed,
}

/// What one pass of the apply processor did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new version was committed.
    Committed { version: Version },
    /// The event was already processed; nothing changed.
    Duplicate,
    /// The source revision was not newer than the last applied one.
    StaleRevision,
    /// A chunk was stored; the snapshot is not complete yet.
    AwaitingChunks { received: u32, total: u32 },
}

impl ApplyOutcome {
    pub fn committed_version(&self) -> Option<Version> {
        match self {
            ApplyOutcome::Committed { version } => Some(*version),
            _ => None,
        }
    }
}
