//! REFDATA Apply - Write Path
//!
//! Everything between an accepted update and a published invalidation:
//! the submission service, the per-partition dispatcher, the transactional
//! apply processor and the outbox relay.

pub mod dispatcher;
pub mod processor;
pub mod publisher;
pub mod relay;
pub mod service;

pub use dispatcher::{CommandDispatcher, DispatcherMetrics, DispatcherSnapshot};
pub use processor::ApplyProcessor;
pub use publisher::CommandPublisher;
pub use relay::{OutboxRelay, RelayMetrics, RelayReport, RelaySnapshot};
pub use service::{SubmissionReceipt, UpdateCommandService, UpdateSubmission};
