//! Outbox relay background task
//!
//! Publishes committed-but-unannounced invalidations. Each tick fetches the
//! oldest unpublished outbox rows, publishes each on the bus and marks it
//! published only after the bus accepted it. A row that fails stays
//! unpublished and is retried on the next tick.

use refdata_core::{OutboxConfig, OutboxEvent, RefdataResult};
use refdata_events::InvalidationBus;
use refdata_storage::PlatformStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters kept across the relay's lifetime.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Relay ticks completed
    pub ticks: AtomicU64,
    /// Rows published and marked
    pub published: AtomicU64,
    /// Rows whose payload did not decode
    pub decode_failures: AtomicU64,
    /// Rows the bus rejected
    pub publish_failures: AtomicU64,
    /// Failed outbox fetches or marks
    pub store_failures: AtomicU64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub ticks: u64,
    pub published: u64,
    pub decode_failures: u64,
    pub publish_failures: u64,
    pub store_failures: u64,
}

/// What one relay pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
}

// ============================================================================
// RELAY
// ============================================================================

pub struct OutboxRelay {
    store: Arc<dyn PlatformStore>,
    bus: Arc<dyn InvalidationBus>,
    config: OutboxConfig,
    metrics: Arc<RelayMetrics>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        bus: Arc<dyn InvalidationBus>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            metrics: Arc::new(RelayMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// One relay pass. Only a failed fetch is returned as an error; per-row
    /// failures are logged, counted and left for the next pass.
    pub async fn relay_once(&self) -> RefdataResult<RelayReport> {
        let rows = match self
            .store
            .fetch_unpublished_outbox(self.config.batch_size)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to fetch unpublished outbox rows");
                return Err(e);
            }
        };

        let mut report = RelayReport {
            fetched: rows.len(),
            ..RelayReport::default()
        };
        for row in &rows {
            if self.relay_row(row).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.fetched > 0 {
            tracing::debug!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                "Outbox relay pass completed"
            );
        }
        Ok(report)
    }

    async fn relay_row(&self, row: &OutboxEvent) -> bool {
        let event = match row.decode_payload() {
            Ok(event) => event,
            Err(e) => {
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(outbox_id = row.id, error = %e, "Undecodable outbox payload");
                return false;
            }
        };

        if let Err(e) = self.bus.publish(&event).await {
            self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                outbox_id = row.id,
                tenant_id = %row.tenant_id,
                dict_code = %row.dict_code,
                version = row.version,
                error = %e,
                "Invalidation publish failed, will retry"
            );
            return false;
        }

        match self.store.mark_outbox_published(row.id).await {
            Ok(_) => {
                self.metrics.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // Published but not marked: the next pass re-publishes it.
                self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(outbox_id = row.id, error = %e, "Failed to mark outbox row published");
                false
            }
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Arc<RelayMetrics> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Outbox relay shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
                    let _ = self.relay_once().await;
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            ticks = snapshot.ticks,
            published = snapshot.published,
            decode_failures = snapshot.decode_failures,
            publish_failures = snapshot.publish_failures,
            store_failures = snapshot.store_failures,
            "Outbox relay completed"
        );
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refdata_core::{
        BusError, InvalidationEvent, InvalidationListener, NewOutboxEvent, RefdataError,
    };
    use refdata_storage::InMemoryPlatformStore;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Bus recording publishes, optionally failing them.
    #[derive(Default)]
    struct FlakyBus {
        down: AtomicBool,
        published: Mutex<Vec<InvalidationEvent>>,
    }

    #[async_trait]
    impl InvalidationBus for FlakyBus {
        async fn publish(&self, event: &InvalidationEvent) -> RefdataResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RefdataError::Bus(BusError::PublishFailed {
                    reason: "down".to_string(),
                }));
            }
            self.published.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn subscribe(&self, _listener: Arc<dyn InvalidationListener>) {}
    }

    async fn seed(store: &InMemoryPlatformStore, versions: &[i64]) {
        let mut tx = store.begin().await.unwrap();
        for v in versions {
            let event = InvalidationEvent::new(format!("e-{v}"), "t1", "COUNTRY", *v);
            tx.insert_outbox_event(&NewOutboxEvent::from_invalidation(&event).unwrap())
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn relay(store: &InMemoryPlatformStore, bus: Arc<FlakyBus>) -> OutboxRelay {
        OutboxRelay::new(
            Arc::new(store.clone()),
            bus,
            OutboxConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_relay_publishes_oldest_first_and_marks() {
        let store = InMemoryPlatformStore::new();
        seed(&store, &[1, 2, 3]).await;
        let bus = Arc::new(FlakyBus::default());
        let relay = relay(&store, Arc::clone(&bus));

        let report = relay.relay_once().await.unwrap();
        assert_eq!(report, RelayReport { fetched: 3, published: 3, failed: 0 });
        let versions: Vec<_> = bus.published.lock().unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.unpublished_outbox_count().await, 0);

        assert_eq!(relay.relay_once().await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn test_bus_failure_leaves_rows_for_next_tick() {
        let store = InMemoryPlatformStore::new();
        seed(&store, &[1]).await;
        let bus = Arc::new(FlakyBus::default());
        bus.down.store(true, Ordering::SeqCst);
        let relay = relay(&store, Arc::clone(&bus));

        let report = relay.relay_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.unpublished_outbox_count().await, 1);

        bus.down.store(false, Ordering::SeqCst);
        assert_eq!(relay.relay_once().await.unwrap().published, 1);
        assert_eq!(store.unpublished_outbox_count().await, 0);
        assert_eq!(relay.metrics().snapshot().publish_failures, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_returned() {
        let store = InMemoryPlatformStore::new();
        store.set_available(false);
        let relay = relay(&store, Arc::new(FlakyBus::default()));
        assert!(relay.relay_once().await.is_err());
        assert_eq!(relay.metrics().snapshot().store_failures, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryPlatformStore::new();
        seed(&store, &[1]).await;
        let bus = Arc::new(FlakyBus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = relay(&store, Arc::clone(&bus));
        let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

        for _ in 0..100 {
            if store.unpublished_outbox_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.unpublished_outbox_count().await, 0);

        shutdown_tx.send(true).unwrap();
        let metrics = handle.await.unwrap();
        assert!(metrics.snapshot().ticks >= 1);
        assert_eq!(metrics.snapshot().published, 1);
    }
}
