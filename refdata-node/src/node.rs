//! Single-process runtime
//!
//! Wires store, registry, providers, apply pipeline, invalidation bus,
//! outbox relay, query cache and submission service into one node that
//! serves both the write and the read role.

use refdata_apply::{
    ApplyProcessor, CommandDispatcher, OutboxRelay, RelayMetrics, SubmissionReceipt,
    UpdateCommandService, UpdateSubmission,
};
use refdata_core::{
    DictionaryRegistry, InvalidationListener, RefdataConfig, RefdataResult, UpdateRequest,
    Version,
};
use refdata_events::{ConfiguredBus, InvalidationBus};
use refdata_storage::{
    GenericItemProvider, InMemoryPlatformStore, ItemRead, PlatformStore, ProviderRouter,
    QueryCache, QueryReadResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct RefdataNode {
    config: RefdataConfig,
    store: Arc<dyn PlatformStore>,
    registry: Arc<DictionaryRegistry>,
    processor: Arc<ApplyProcessor>,
    dispatcher: CommandDispatcher,
    bus: ConfiguredBus,
    relay: Arc<OutboxRelay>,
    cache: QueryCache,
    service: Arc<UpdateCommandService>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl RefdataNode {
    /// Node over a fresh in-memory store.
    pub fn new(config: RefdataConfig) -> RefdataResult<Self> {
        Self::with_store(config, Arc::new(InMemoryPlatformStore::new()))
    }

    pub fn with_store(config: RefdataConfig, store: Arc<dyn PlatformStore>) -> RefdataResult<Self> {
        config.validate()?;

        let registry = Arc::new(DictionaryRegistry::new(&config.dictionaries));
        let providers = ProviderRouter::new(Arc::new(GenericItemProvider::new(Arc::clone(&store))));
        let processor = Arc::new(ApplyProcessor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            providers.clone(),
        ));
        let dispatcher = CommandDispatcher::new(Arc::clone(&processor), config.dispatcher.clone());

        let bus = ConfiguredBus::from_config(&config.bus);
        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&store),
            Arc::new(bus.clone()),
            config.outbox.clone(),
        ));

        let cache = QueryCache::new(
            Arc::clone(&registry),
            providers,
            config.query.clone(),
            config.cache.reload_parallelism,
        );
        let listener: Arc<dyn InvalidationListener> = Arc::new(cache.clone());
        bus.subscribe(listener);

        let service = Arc::new(UpdateCommandService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(dispatcher.clone()),
            processor.settled_signal(),
            config.consistency.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            registry,
            processor,
            dispatcher,
            bus,
            relay,
            cache,
            service,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the outbox relay and the bus background tasks. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let relay = Arc::clone(&self.relay);
        let relay_shutdown = self.shutdown_tx.subscribe();
        let mut handles = vec![tokio::spawn(async move {
            relay.run(relay_shutdown).await;
        })];
        handles.extend(self.bus.start(self.shutdown_tx.subscribe()));

        tracing::info!(
            dictionaries = self.registry.len(),
            bus = ?self.bus.kind(),
            tasks = handles.len(),
            "REFDATA node started"
        );
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    /// Drain the dispatcher, flush the outbox once more, then stop the
    /// background tasks.
    pub async fn shutdown(&self) {
        let drained = self.dispatcher.shutdown().await;
        if let Err(e) = self.relay.relay_once().await {
            tracing::warn!(error = %e, "Final outbox flush failed");
        }

        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!(drained, "REFDATA node stopped");
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &RefdataConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn PlatformStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<DictionaryRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn processor(&self) -> Arc<ApplyProcessor> {
        Arc::clone(&self.processor)
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn bus(&self) -> &ConfiguredBus {
        &self.bus
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn service(&self) -> Arc<UpdateCommandService> {
        Arc::clone(&self.service)
    }

    pub fn relay_metrics(&self) -> Arc<RelayMetrics> {
        self.relay.metrics()
    }

    // ========================================================================
    // WRITE + READ SURFACE
    // ========================================================================

    pub async fn submit(&self, submission: UpdateSubmission) -> RefdataResult<SubmissionReceipt> {
        self.service.submit(submission).await
    }

    pub async fn status(&self, tenant_id: &str, event_id: &str) -> RefdataResult<UpdateRequest> {
        self.service.status(tenant_id, event_id).await
    }

    pub async fn read_all(
        &self,
        tenant_id: &str,
        dict_code: &str,
        min_version: Option<Version>,
    ) -> RefdataResult<QueryReadResult> {
        self.cache.read_all(tenant_id, dict_code, min_version).await
    }

    pub async fn read_item(
        &self,
        tenant_id: &str,
        dict_code: &str,
        key: &str,
        min_version: Option<Version>,
    ) -> RefdataResult<ItemRead> {
        self.cache
            .read_item(tenant_id, dict_code, key, min_version)
            .await
    }

    pub async fn read_items<'a>(
        &self,
        tenant_id: &str,
        dict_code: &str,
        keys: impl IntoIterator<Item = &'a str>,
        min_version: Option<Version>,
    ) -> RefdataResult<QueryReadResult> {
        self.cache
            .read_items(tenant_id, dict_code, keys, min_version)
            .await
    }

    pub async fn current_version(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<Version> {
        self.cache.current_version(tenant_id, dict_code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdata_core::{BusKind, ConfigError, DictionaryConfig, RefdataError};
    use std::time::Duration;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RefdataConfig::with_dictionaries(["COUNTRY"]);
        config.outbox.batch_size = 0;
        let err = RefdataNode::new(config).err().unwrap();
        assert!(matches!(err, RefdataError::Config(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_joins_tasks() {
        let mut config = RefdataConfig::with_dictionaries(["COUNTRY"]);
        config.bus.kind = BusKind::Durable;
        config.bus.recovery_poll_interval = Duration::from_millis(100);
        let node = RefdataNode::new(config).unwrap();

        node.start();
        node.start();
        // relay + push listener + recovery loop
        assert_eq!(node.tasks.lock().unwrap().len(), 3);

        node.shutdown().await;
        assert!(node.tasks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_dictionary_not_served() {
        let config = RefdataConfig {
            dictionaries: vec![
                DictionaryConfig::enabled("COUNTRY"),
                DictionaryConfig::disabled("CURRENCY"),
            ],
            ..RefdataConfig::default()
        };
        let node = RefdataNode::new(config).unwrap();
        assert!(node.registry().is_registered("COUNTRY"));
        assert!(!node.registry().is_registered("CURRENCY"));
    }
}
