//! Hand-off from the submission edge to the apply pipeline.

use async_trait::async_trait;
use refdata_core::{RefdataResult, UpdateCommand};

/// Transport carrying accepted commands to an apply processor.
///
/// Implementations must keep commands of one partition in publish order.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, command: UpdateCommand) -> RefdataResult<()>;
}
