//! Identity types for REFDATA entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Tenant identifier as supplied by the submitting edge.
pub type TenantId = String;

/// Idempotency key of an update event, unique per tenant.
pub type EventId = String;

/// Committed dictionary version. Starts at 1 for the first commit, 0 means
/// "nothing committed yet".
pub type Version = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Materialized dictionary contents, ordered by item key.
pub type ItemMap = BTreeMap<String, Value>;

/// Generate a new event id (UUIDv7, timestamp-sortable).
pub fn new_event_id() -> EventId {
    Uuid::now_v7().to_string()
}

/// Key of one (tenant, dictionary) partition.
///
/// This is the unit of write ordering, of version numbering and of caching.
/// It cannot be built without a tenant, so every lookup that goes through it
/// is tenant-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DictionaryKey {
    tenant_id: TenantId,
    dict_code: String,
}

impl DictionaryKey {
    pub fn new(tenant_id: impl Into<TenantId>, dict_code: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            dict_code: dict_code.into(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn dict_code(&self) -> &str {
        &self.dict_code
    }

    /// Partition key string, `tenantId:dictCode`.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.dict_code)
    }
}

impl fmt::Display for DictionaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.dict_code)
    }
}
