//! Invalidation events announcing committed versions

use crate::{DictionaryKey, EventId, TenantId, Timestamp, Version};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// "Version N of (tenant, dictionary) is committed."
///
/// Delivery is at-least-once and may be out of order; consumers must treat
/// it as a hint to re-fetch when stale, never as data to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub dict_code: String,
    pub version: Version,
    pub committed_at: Timestamp,
}

impl InvalidationEvent {
    pub fn new(
        event_id: impl Into<EventId>,
        tenant_id: impl Into<TenantId>,
        dict_code: impl Into<String>,
        version: Version,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            tenant_id: tenant_id.into(),
            dict_code: dict_code.into(),
            version,
            committed_at: Utc::now(),
        }
    }

    pub fn dictionary_key(&self) -> DictionaryKey {
        DictionaryKey::new(self.tenant_id.clone(), self.dict_code.clone())
    }

    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.dict_code)
    }
}

/// Receiver of invalidation events.
///
/// Called from bus delivery paths; implementations must not block.
pub trait InvalidationListener: Send + Sync {
    fn on_invalidation(&self, event: &InvalidationEvent);
}
