//! REFDATA Events - Invalidation Bus
//!
//! Announces committed dictionary versions to query nodes. Two variants:
//! an in-process bus that calls listeners synchronously, and a durable bus
//! pairing pub/sub with a replayable log and a recovery loop.

pub mod bus;
pub mod configured;
pub mod durable;
pub mod local;
pub mod memory;

pub use bus::InvalidationBus;
pub use configured::ConfiguredBus;
pub use durable::{
    DurableInvalidationBus, InvalidationLog, LogRecord, PubSubChannel, RecoveryMetrics,
    RecoverySnapshot,
};
pub use local::LocalInvalidationBus;
pub use memory::{BroadcastChannel, InMemoryLog, DEFAULT_CHANNEL_CAPACITY};
