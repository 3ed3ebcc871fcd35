//! Durable invalidation bus
//!
//! Every event is sent two ways: a best-effort pub/sub broadcast for low
//! latency, and an append to a replayable log. A recovery loop tails the log
//! and redelivers anything the push path missed. A per-partition high-water
//! version suppresses redelivery of events already seen.

use crate::bus::{InvalidationBus, ListenerSet};
use crate::memory::{BroadcastChannel, InMemoryLog};
use async_trait::async_trait;
use dashmap::DashMap;
use refdata_core::wire::{decode_invalidation, encode_invalidation};
use refdata_core::{BusConfig, InvalidationEvent, InvalidationListener, RefdataResult, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// TRANSPORTS
// ============================================================================

/// Fire-and-forget fan-out transport.
#[async_trait]
pub trait PubSubChannel: Send + Sync {
    async fn broadcast(&self, payload: &str) -> RefdataResult<()>;

    /// A receiver for every payload broadcast after this call.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// One record of the replayable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Monotonic, 1-based position
    pub position: u64,
    /// Partition key the record was appended under
    pub key: String,
    pub payload: String,
}

/// Append-only log readable from any position.
#[async_trait]
pub trait InvalidationLog: Send + Sync {
    /// Append and return the new record's position.
    async fn append(&self, key: &str, payload: &str) -> RefdataResult<u64>;

    /// Up to `limit` records with a position strictly greater than `position`,
    /// in position order.
    async fn read_after(&self, position: u64, limit: usize) -> RefdataResult<Vec<LogRecord>>;
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    /// Recovery passes run
    pub ticks: AtomicU64,
    /// Events received over pub/sub
    pub push_received: AtomicU64,
    /// Log records read by recovery
    pub records_read: AtomicU64,
    /// Events delivered by recovery because push missed them
    pub redelivered: AtomicU64,
    /// Records skipped because the payload did not decode
    pub undecodable: AtomicU64,
    /// Failed log reads
    pub failures: AtomicU64,
}

impl RecoveryMetrics {
    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            push_received: self.push_received.load(Ordering::Relaxed),
            records_read: self.records_read.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub ticks: u64,
    pub push_received: u64,
    pub records_read: u64,
    pub redelivered: u64,
    pub undecodable: u64,
    pub failures: u64,
}

// ============================================================================
// BUS
// ============================================================================

struct DurableInner {
    channel: Arc<dyn PubSubChannel>,
    log: Arc<dyn InvalidationLog>,
    listeners: ListenerSet,
    /// Highest version delivered per partition
    high_water: DashMap<String, Version>,
    /// Last log position consumed by recovery
    cursor: Mutex<u64>,
    config: BusConfig,
    metrics: RecoveryMetrics,
}

/// Pub/sub plus replayable log. Cheap to clone.
#[derive(Clone)]
pub struct DurableInvalidationBus {
    inner: Arc<DurableInner>,
}

impl DurableInvalidationBus {
    pub fn new(
        channel: Arc<dyn PubSubChannel>,
        log: Arc<dyn InvalidationLog>,
        config: BusConfig,
    ) -> Self {
        let cursor = Mutex::new(config.start_position);
        Self {
            inner: Arc::new(DurableInner {
                channel,
                log,
                listeners: ListenerSet::default(),
                high_water: DashMap::new(),
                cursor,
                config,
                metrics: RecoveryMetrics::default(),
            }),
        }
    }

    /// Bus over the in-process broadcast channel and log.
    pub fn in_memory(config: BusConfig) -> Self {
        Self::new(
            Arc::new(BroadcastChannel::default()),
            Arc::new(InMemoryLog::new()),
            config,
        )
    }

    pub fn metrics(&self) -> RecoverySnapshot {
        self.inner.metrics.snapshot()
    }

    /// Last log position recovery has consumed.
    pub async fn cursor(&self) -> u64 {
        *self.inner.cursor.lock().await
    }

    /// Highest version delivered for a partition, if any.
    pub fn high_water(&self, partition_key: &str) -> Option<Version> {
        self.inner.high_water.get(partition_key).map(|v| *v)
    }

    /// Record `event` as seen. Returns true when it is newer than anything
    /// seen before for its partition.
    fn raise_high_water(&self, event: &InvalidationEvent) -> bool {
        let mut seen = self
            .inner
            .high_water
            .entry(event.partition_key())
            .or_insert(0);
        if event.version > *seen {
            *seen = event.version;
            true
        } else {
            false
        }
    }

    /// Push delivery is always forwarded; it only moves the high-water mark.
    fn deliver_push(&self, event: &InvalidationEvent) {
        self.inner.metrics.push_received.fetch_add(1, Ordering::Relaxed);
        self.raise_high_water(event);
        self.inner.listeners.dispatch(event);
    }

    /// One recovery pass: drain the log from the cursor, redelivering events
    /// newer than the partition high-water mark. Returns how many were
    /// redelivered. A failed read leaves the cursor where it was.
    pub async fn recover_once(&self) -> RefdataResult<usize> {
        let batch_size = self.inner.config.recovery_batch_size.max(1);
        let mut cursor = self.inner.cursor.lock().await;
        let mut redelivered = 0;

        loop {
            let batch = match self.inner.log.read_after(*cursor, batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.inner.metrics.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, cursor = *cursor, "Invalidation log read failed");
                    return Err(e);
                }
            };
            let full = batch.len() >= batch_size;
            self.inner
                .metrics
                .records_read
                .fetch_add(batch.len() as u64, Ordering::Relaxed);

            for record in batch {
                *cursor = record.position;
                match decode_invalidation(&record.payload) {
                    Ok(event) => {
                        if self.raise_high_water(&event) {
                            self.inner.listeners.dispatch(&event);
                            redelivered += 1;
                        }
                    }
                    Err(e) => {
                        self.inner.metrics.undecodable.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            position = record.position,
                            key = %record.key,
                            error = %e,
                            "Skipping undecodable invalidation record"
                        );
                    }
                }
            }

            if !full {
                break;
            }
        }

        if redelivered > 0 {
            self.inner
                .metrics
                .redelivered
                .fetch_add(redelivered as u64, Ordering::Relaxed);
            tracing::info!(redelivered, cursor = *cursor, "Recovered missed invalidations");
        }
        Ok(redelivered)
    }

    /// Spawn the push listener and the recovery loop. Both exit when
    /// `shutdown` turns true or its sender is dropped.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        // Subscribe before spawning so nothing published after start() is missed.
        let rx = self.inner.channel.subscribe();
        vec![
            tokio::spawn(self.clone().push_listener(rx, shutdown.clone())),
            tokio::spawn(self.clone().recovery_loop(shutdown)),
        ]
    }

    async fn push_listener(
        self,
        mut rx: broadcast::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = rx.recv() => match message {
                    Ok(payload) => match decode_invalidation(&payload) {
                        Ok(event) => self.deliver_push(&event),
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping undecodable pub/sub message");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Invalidation subscriber lagged; recovery will redeliver");
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Invalidation channel closed");
                        break;
                    }
                }
            }
        }
        tracing::debug!("Invalidation push listener stopped");
    }

    async fn recovery_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.inner.config.recovery_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_ms = self.inner.config.recovery_poll_interval.as_millis() as u64,
            batch_size = self.inner.config.recovery_batch_size,
            start_position = self.inner.config.start_position,
            "Invalidation recovery started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.inner.metrics.ticks.fetch_add(1, Ordering::Relaxed);
                    // Failures are counted and logged inside.
                    let _ = self.recover_once().await;
                }
            }
        }

        let snapshot = self.metrics();
        tracing::info!(
            ticks = snapshot.ticks,
            push_received = snapshot.push_received,
            records_read = snapshot.records_read,
            redelivered = snapshot.redelivered,
            undecodable = snapshot.undecodable,
            failures = snapshot.failures,
            "Invalidation recovery stopped"
        );
    }
}

#[async_trait]
impl InvalidationBus for DurableInvalidationBus {
    async fn publish(&self, event: &InvalidationEvent) -> RefdataResult<()> {
        let payload = encode_invalidation(event)?;
        let key = event.partition_key();

        if let Err(e) = self.inner.channel.broadcast(&payload).await {
            tracing::warn!(partition = %key, version = event.version, error = %e, "Pub/sub broadcast failed; log will carry the event");
        }

        let position = self.inner.log.append(&key, &payload).await?;
        tracing::trace!(partition = %key, version = event.version, position, "Invalidation appended");
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        self.inner.listeners.add(listener);
    }
}
