//! Error types for REFDATA operations
//!
//! Duplicate events and stale source revisions are not errors; they are
//! reported through [`crate::ApplyOutcome`] and [`crate::ClaimOutcome`].

use crate::Version;
use thiserror::Error;

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Insert failed for {table}: {reason}")]
    InsertFailed { table: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error(
        "Version allocation exhausted for {tenant_id}:{dict_code} after {attempts} attempts"
    )]
    VersionAllocationExhausted {
        tenant_id: String,
        dict_code: String,
        attempts: u32,
    },

    #[error("Corrupted record in {table}: {reason}")]
    Corrupted { table: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Input validation errors. Raised before any state is created.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid chunk metadata: {reason}")]
    InvalidChunkMetadata { reason: String },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Lookup misses surfaced to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("Dictionary not registered: {dict_code}")]
    Dictionary { dict_code: String },

    #[error("Update request not found: {tenant_id}/{event_id}")]
    UpdateRequest { tenant_id: String, event_id: String },

    #[error("Item {key} not found in {tenant_id}:{dict_code}")]
    Item {
        tenant_id: String,
        dict_code: String,
        key: String,
    },
}

/// Read-side consistency errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("Version {requested} not committed yet (committed: {committed})")]
    VersionNotCommitted { requested: Version, committed: Version },
}

/// Invalidation bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Publish failed: {reason}")]
    PublishFailed { reason: String },

    #[error("Log append failed for {key}: {reason}")]
    LogAppendFailed { key: String, reason: String },

    #[error("Log read failed: {reason}")]
    LogReadFailed { reason: String },

    #[error("Bus closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Write-path errors surfaced to submitters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Update failed: {message}")]
    UpdateFailed { event_id: String, message: String },

    #[error("Dispatcher is shut down, rejected command for {partition_key}")]
    DispatcherClosed { partition_key: String },
}

/// Master error type for all REFDATA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefdataError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
}

impl RefdataError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Infrastructure failures and unmet version barriers are retryable;
    /// caller errors (validation, unknown dictionary, failed update) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RefdataError::Storage(e) => matches!(
                e,
                StorageError::Unavailable { .. }
                    | StorageError::TransactionFailed { .. }
                    | StorageError::LockPoisoned
            ),
            RefdataError::Bus(_) => true,
            RefdataError::Consistency(ConsistencyError::VersionNotCommitted { .. }) => true,
            RefdataError::Validation(_)
            | RefdataError::NotFound(_)
            | RefdataError::Config(_)
            | RefdataError::Apply(_) => false,
        }
    }
}

/// Result type alias for REFDATA operations.
pub type RefdataResult<T> = Result<T, RefdataError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_committed_display() {
        let err = ConsistencyError::VersionNotCommitted {
            requested: 7,
            committed: 5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("7"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn test_allocation_exhausted_display() {
        let err = StorageError::VersionAllocationExhausted {
            tenant_id: "acme".to_string(),
            dict_code: "COUNTRY".to_string(),
            attempts: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("acme:COUNTRY"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_update_failed_display_matches_submitter_message() {
        let err = ApplyError::UpdateFailed {
            event_id: "e-1".to_string(),
            message: "Stale sourceRevision".to_string(),
        };
        assert_eq!(err.to_string(), "Update failed: Stale sourceRevision");
    }

    #[test]
    fn test_refdata_error_from_variants() {
        let storage = RefdataError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, RefdataError::Storage(_)));

        let validation = RefdataError::from(ValidationError::RequiredFieldMissing {
            field: "tenantId".to_string(),
        });
        assert!(matches!(validation, RefdataError::Validation(_)));

        let not_found = RefdataError::from(NotFoundError::Dictionary {
            dict_code: "NOPE".to_string(),
        });
        assert!(matches!(not_found, RefdataError::NotFound(_)));

        let bus = RefdataError::from(BusError::Closed);
        assert!(matches!(bus, RefdataError::Bus(_)));
    }

    #[test]
    fn test_version_not_committed_is_distinct_from_not_found() {
        let err = RefdataError::from(ConsistencyError::VersionNotCommitted {
            requested: 2,
            committed: 1,
        });
        assert!(!matches!(err, RefdataError::NotFound(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RefdataError::from(StorageError::Unavailable {
            reason: "down".to_string()
        })
        .is_retryable());
        assert!(!RefdataError::from(StorageError::VersionAllocationExhausted {
            tenant_id: "t".to_string(),
            dict_code: "D".to_string(),
            attempts: 3,
        })
        .is_retryable());
        assert!(!RefdataError::from(ValidationError::InvalidChunkMetadata {
            reason: "x".to_string()
        })
        .is_retryable());
    }
}
