//! Update commands submitted by writers

use crate::{
    new_event_id, DictionaryKey, EventId, EventType, ItemOperation, TenantId, Timestamp,
    ValidationError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItem {
    pub key: String,
    pub op: ItemOperation,
    /// Required for UPSERT, ignored for DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl UpdateItem {
    pub fn upsert(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            op: ItemOperation::Upsert,
            payload: Some(payload),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: ItemOperation::Delete,
            payload: None,
        }
    }
}

/// An ordered update event for one (tenant, dictionary) partition.
///
/// Commands are immutable once built. The idempotency key is
/// `(tenant_id, event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCommand {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub source: String,
    pub dict_code: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_total: Option<u32>,
    #[serde(default = "Utc::now")]
    pub occurred_at: Timestamp,
    #[serde(default)]
    pub items: Vec<UpdateItem>,
}

impl UpdateCommand {
    /// Build a DELTA command with a fresh event id.
    pub fn delta(
        tenant_id: impl Into<TenantId>,
        dict_code: impl Into<String>,
        items: Vec<UpdateItem>,
    ) -> Self {
        Self::new(tenant_id, dict_code, EventType::Delta, items)
    }

    /// Build an unchunked SNAPSHOT command with a fresh event id.
    pub fn snapshot(
        tenant_id: impl Into<TenantId>,
        dict_code: impl Into<String>,
        items: Vec<UpdateItem>,
    ) -> Self {
        Self::new(tenant_id, dict_code, EventType::Snapshot, items)
    }

    fn new(
        tenant_id: impl Into<TenantId>,
        dict_code: impl Into<String>,
        event_type: EventType,
        items: Vec<UpdateItem>,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            tenant_id: tenant_id.into(),
            source: String::new(),
            dict_code: dict_code.into(),
            event_type,
            source_revision: None,
            snapshot_id: None,
            chunk_index: None,
            chunks_total: None,
            occurred_at: Utc::now(),
            items,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<EventId>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_source_revision(mut self, revision: i64) -> Self {
        self.source_revision = Some(revision);
        self
    }

    /// Attach chunk metadata (`chunk_index` is 1-based).
    pub fn with_chunk(mut self, snapshot_id: impl Into<String>, chunk_index: u32, chunks_total: u32) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self.chunk_index = Some(chunk_index);
        self.chunks_total = Some(chunks_total);
        self
    }

    /// `tenantId:dictCode`, the unit of write ordering.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.dict_code)
    }

    pub fn dictionary_key(&self) -> DictionaryKey {
        DictionaryKey::new(self.tenant_id.clone(), self.dict_code.clone())
    }

    pub fn is_snapshot(&self) -> bool {
        self.event_type == EventType::Snapshot
    }

    /// A SNAPSHOT is chunked iff all chunk fields are set and `chunks_total > 1`.
    pub fn is_chunked_snapshot(&self) -> bool {
        self.is_snapshot()
            && self.snapshot_id.is_some()
            && self.chunk_index.is_some()
            && matches!(self.chunks_total, Some(total) if total > 1)
    }

    /// Validate the command shape. No state is touched.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "tenantId".to_string(),
            });
        }
        if self.dict_code.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "dictCode".to_string(),
            });
        }
        for item in &self.items {
            if item.key.trim().is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: "items.key".to_string(),
                    reason: "item key must not be blank".to_string(),
                });
            }
            if item.op == ItemOperation::Upsert && item.payload.is_none() {
                return Err(ValidationError::InvalidValue {
                    field: "items.payload".to_string(),
                    reason: format!("UPSERT of '{}' requires a payload", item.key),
                });
            }
        }
        self.validate_chunk_metadata()
    }

    /// Chunk fields of a SNAPSHOT are all-or-nothing, with
    /// `chunks_total >= 1` and `1 <= chunk_index <= chunks_total`.
    pub fn validate_chunk_metadata(&self) -> Result<(), ValidationError> {
        if !self.is_snapshot() {
            return Ok(());
        }
        match (&self.snapshot_id, self.chunk_index, self.chunks_total) {
            (None, None, None) => Ok(()),
            (Some(snapshot_id), Some(index), Some(total)) => {
                if snapshot_id.trim().is_empty() {
                    return Err(ValidationError::InvalidChunkMetadata {
                        reason: "snapshotId must not be blank".to_string(),
                    });
                }
                if total < 1 {
                    return Err(ValidationError::InvalidChunkMetadata {
                        reason: "chunksTotal must be >= 1".to_string(),
                    });
                }
                if index < 1 || index > total {
                    return Err(ValidationError::InvalidChunkMetadata {
                        reason: format!("chunkIndex {} outside 1..={}", index, total),
                    });
                }
                Ok(())
            }
            _ => Err(ValidationError::InvalidChunkMetadata {
                reason: "snapshotId, chunkIndex and chunksTotal must be set together".to_string(),
            }),
        }
    }
}
