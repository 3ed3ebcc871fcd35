//! REFDATA Core - Entity Types
//!
//! Pure data structures shared by every other crate: update commands, the
//! persisted records of the apply pipeline, invalidation events, the error
//! taxonomy, configuration and the dictionary registry.
//! This crate performs no I/O.

pub mod command;
pub mod config;
pub mod constants;
pub mod enums;
pub mod error;
pub mod identity;
pub mod invalidation;
pub mod records;
pub mod registry;
pub mod wire;

pub use command::{UpdateCommand, UpdateItem};
pub use config::{
    BusConfig, BusKind, CacheConfig, ConsistencyConfig, DictionaryConfig, DispatcherConfig,
    OutboxConfig, QueryConfig, RefdataConfig,
};
pub use enums::{
    ConsistencyMode, DataSource, EnumParseError, EventType, ItemOperation, UpdateStatus,
};
pub use error::{
    ApplyError, BusError, ConfigError, ConsistencyError, NotFoundError, RefdataError,
    RefdataResult, StorageError, ValidationError,
};
pub use identity::{new_event_id, DictionaryKey, EventId, ItemMap, TenantId, Timestamp, Version};
pub use invalidation::{InvalidationEvent, InvalidationListener};
pub use records::{
    ApplyOutcome, ClaimOutcome, DictionaryMeta, NewOutboxEvent, OutboxEvent, ProcessedEvent,
    SnapshotChunk, UpdateRequest,
};
pub use registry::DictionaryRegistry;
