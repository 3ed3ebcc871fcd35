//! Shared constants and defaults

/// Maximum attempts of the increment-or-insert version allocation loop.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 3;

/// Source tag for commands submitted through the service API.
pub const SOURCE_API: &str = "API";

/// Source tag for commands ingested from an upstream transport.
pub const SOURCE_EXTERNAL: &str = "EXTERNAL";

/// Failure message recorded for stale source revisions.
pub const STALE_REVISION_MESSAGE: &str = "Stale sourceRevision";

/// Failure message recorded when an apply error carries no text.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

// Defaults (milliseconds unless noted)
pub const DEFAULT_WAIT_COMMIT_TIMEOUT_MS: u64 = 300;
pub const MIN_WAIT_COMMIT_TIMEOUT_MS: u64 = 10;
pub const DEFAULT_COMMIT_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_WAIT_FOR_RELOAD_MS: u64 = 100;
pub const DEFAULT_RELOAD_POLL_INTERVAL_MS: u64 = 5;
pub const DEFAULT_OUTBOX_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_OUTBOX_BATCH_SIZE: usize = 200;
pub const DEFAULT_RELOAD_PARALLELISM: usize = 8;
pub const DEFAULT_RECOVERY_POLL_INTERVAL_MS: u64 = 1000;
pub const MIN_RECOVERY_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_RECOVERY_BATCH_SIZE: usize = 500;
pub const DEFAULT_DISPATCHER_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
