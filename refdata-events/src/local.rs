//! In-process invalidation bus.

use crate::bus::{InvalidationBus, ListenerSet};
use async_trait::async_trait;
use refdata_core::{InvalidationEvent, InvalidationListener, RefdataResult};
use std::sync::Arc;
use tracing::trace;

/// Fans every event out to all listeners, synchronously, on publish.
///
/// For deployments where one process serves both the apply and the query
/// role, and for tests.
#[derive(Clone, Default)]
pub struct LocalInvalidationBus {
    listeners: Arc<ListenerSet>,
}

impl LocalInvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl InvalidationBus for LocalInvalidationBus {
    async fn publish(&self, event: &InvalidationEvent) -> RefdataResult<()> {
        let delivered = self.listeners.dispatch(event);
        trace!(
            partition = %event.partition_key(),
            version = event.version,
            delivered,
            "Local invalidation published"
        );
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners.add(listener);
    }
}
