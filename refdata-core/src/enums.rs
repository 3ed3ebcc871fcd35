//! Enum types for REFDATA
//!
//! All enums serialize as SCREAMING_SNAKE_CASE strings on the wire and in the
//! store (`DELTA`, `SNAPSHOT`, `PENDING`, ...). Parsing is case-insensitive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an invalid enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ============================================================================
// EVENT TYPE
// ============================================================================

/// Kind of update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Item-level changes applied on top of the current item set
    Delta,
    /// Full replacement of the item set, possibly split into chunks
    Snapshot,
}

impl EventType {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EventType::Delta => "DELTA",
            EventType::Snapshot => "SNAPSHOT",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "DELTA" => Ok(EventType::Delta),
            "SNAPSHOT" => Ok(EventType::Snapshot),
            _ => Err(EnumParseError {
                kind: "event type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for EventType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// ITEM OPERATION
// ============================================================================

/// Operation carried by a single update item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemOperation {
    /// Insert or replace the item payload
    Upsert,
    /// Remove the item; payload is ignored
    Delete,
}

impl ItemOperation {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ItemOperation::Upsert => "UPSERT",
            ItemOperation::Delete => "DELETE",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "UPSERT" => Ok(ItemOperation::Upsert),
            "DELETE" => Ok(ItemOperation::Delete),
            _ => Err(EnumParseError {
                kind: "item operation",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ItemOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for ItemOperation {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// UPDATE STATUS
// ============================================================================

/// Lifecycle status of a persisted update request.
///
/// ```text
/// PENDING ──→ COMMITTED
///    └──────→ FAILED
/// ```
///
/// Terminal states are never re-opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Pending,
    Committed,
    Failed,
}

impl UpdateStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "PENDING",
            UpdateStatus::Committed => "COMMITTED",
            UpdateStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(UpdateStatus::Pending),
            "COMMITTED" => Ok(UpdateStatus::Committed),
            "FAILED" => Ok(UpdateStatus::Failed),
            _ => Err(EnumParseError {
                kind: "update status",
                value: s.to_string(),
            }),
        }
    }

    /// Check if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStatus::Committed | UpdateStatus::Failed)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// CONSISTENCY MODE
// ============================================================================

/// Write consistency requested by a submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyMode {
    /// Return PENDING as soon as the command is queued
    #[default]
    Async,
    /// Block until COMMITTED, FAILED or the timeout elapses
    WaitCommit,
}

impl ConsistencyMode {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ConsistencyMode::Async => "ASYNC",
            ConsistencyMode::WaitCommit => "WAIT_COMMIT",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "ASYNC" => Ok(ConsistencyMode::Async),
            "WAIT_COMMIT" => Ok(ConsistencyMode::WaitCommit),
            _ => Err(EnumParseError {
                kind: "consistency mode",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for ConsistencyMode {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// DATA SOURCE
// ============================================================================

/// Where a query result was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    /// In-memory cache snapshot
    Memory,
    /// One-shot direct read from the durable store
    StoreFallback,
}

impl DataSource {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DataSource::Memory => "MEMORY",
            DataSource::StoreFallback => "STORE_FALLBACK",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}
