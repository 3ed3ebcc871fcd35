//! Read-side query cache.
//!
//! Readers may pass a version barrier (`min_version`); results carry the
//! version they reflect and whether they came from memory or from a direct
//! store read, so staleness is never hidden from the caller.

pub mod query;
pub mod snapshot;

pub use query::{QueryCache, QueryCacheMetrics, QueryCacheSnapshot};
pub use snapshot::{CacheSnapshot, ItemRead, QueryReadResult};
