//! REFDATA Storage - Durable Store Contract, Versioning and Query Cache
//!
//! Defines the transactional store abstraction the apply pipeline runs on,
//! the version/outbox repository, pluggable dictionary apply providers and
//! the version-barrier query cache. An in-memory store implements the
//! contract for single-process deployments and tests.

pub mod cache;
pub mod memory;
pub mod provider;
pub mod repository;
pub mod store;

pub use cache::{CacheSnapshot, ItemRead, QueryCache, QueryCacheMetrics, QueryCacheSnapshot, QueryReadResult};
pub use memory::InMemoryPlatformStore;
pub use provider::{DictionaryProvider, GenericItemProvider, ProviderRouter};
pub use repository::{
    allocate_next_version, current_committed_version, insert_outbox_event, is_stale_revision,
    last_source_revision, merge_source_revision,
};
pub use store::{PlatformStore, PlatformTx};
