//! REFDATA Node - Runtime Wiring
//!
//! Assembles the write path, the invalidation bus and the read path into a
//! single-process node, and provides the binary's tracing setup.

pub mod node;
pub mod telemetry;

pub use node::RefdataNode;
pub use telemetry::{init_tracing, DEFAULT_LOG_FILTER};
