//! Invalidation bus contract.

use async_trait::async_trait;
use refdata_core::{InvalidationEvent, InvalidationListener, RefdataResult};
use std::sync::{Arc, PoisonError, RwLock};

/// Announces committed versions to every subscribed listener.
///
/// Delivery is at-least-once. Listeners are invoked in unspecified order.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Publish one event. An error means the event may not be delivered and
    /// the caller must retry.
    async fn publish(&self, event: &InvalidationEvent) -> RefdataResult<()>;

    /// Register a listener for every subsequent event.
    fn subscribe(&self, listener: Arc<dyn InvalidationListener>);
}

/// Registered listeners, shared by both bus variants.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Invoke every listener with `event`. Returns how many were called.
    pub(crate) fn dispatch(&self, event: &InvalidationEvent) -> usize {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.on_invalidation(event);
        }
        listeners.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
