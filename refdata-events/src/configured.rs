//! Bus selection by configuration.

use crate::bus::InvalidationBus;
use crate::durable::DurableInvalidationBus;
use crate::local::LocalInvalidationBus;
use async_trait::async_trait;
use refdata_core::{BusConfig, BusKind, InvalidationEvent, InvalidationListener, RefdataResult};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The bus variant chosen by `BusConfig::kind`.
#[derive(Clone)]
pub enum ConfiguredBus {
    Local(LocalInvalidationBus),
    Durable(DurableInvalidationBus),
}

impl ConfiguredBus {
    /// The durable variant runs over in-process transports.
    pub fn from_config(config: &BusConfig) -> Self {
        match config.kind {
            BusKind::Local => Self::Local(LocalInvalidationBus::new()),
            BusKind::Durable => Self::Durable(DurableInvalidationBus::in_memory(config.clone())),
        }
    }

    pub fn kind(&self) -> BusKind {
        match self {
            Self::Local(_) => BusKind::Local,
            Self::Durable(_) => BusKind::Durable,
        }
    }

    /// Start background delivery. The local bus has none.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        match self {
            Self::Local(_) => Vec::new(),
            Self::Durable(bus) => bus.start(shutdown),
        }
    }
}

#[async_trait]
impl InvalidationBus for ConfiguredBus {
    async fn publish(&self, event: &InvalidationEvent) -> RefdataResult<()> {
        match self {
            Self::Local(bus) => bus.publish(event).await,
            Self::Durable(bus) => bus.publish(event).await,
        }
    }

    fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        match self {
            Self::Local(bus) => bus.subscribe(listener),
            Self::Durable(bus) => bus.subscribe(listener),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_config() {
        let local = ConfiguredBus::from_config(&BusConfig::default());
        assert_eq!(local.kind(), BusKind::Local);

        let durable = ConfiguredBus::from_config(&BusConfig {
            kind: BusKind::Durable,
            ..BusConfig::default()
        });
        assert_eq!(durable.kind(), BusKind::Durable);
    }

    #[tokio::test]
    async fn test_local_start_spawns_nothing() {
        let (_tx, rx) = watch::channel(false);
        assert!(ConfiguredBus::from_config(&BusConfig::default())
            .start(rx)
            .is_empty());
    }
}
