//! In-memory pub/sub channel and replayable log backends.

use crate::durable::{InvalidationLog, LogRecord, PubSubChannel};
use async_trait::async_trait;
use refdata_core::{BusError, RefdataResult, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Default buffer of the in-memory pub/sub channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Pub/sub channel over a tokio broadcast channel.
///
/// Slow subscribers lag and lose messages, like a real pub/sub transport;
/// the durable log covers the gap.
pub struct BroadcastChannel {
    tx: broadcast::Sender<String>,
    available: AtomicBool,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a transport outage: broadcasts fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl PubSubChannel for BroadcastChannel {
    async fn broadcast(&self, payload: &str) -> RefdataResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BusError::PublishFailed {
                reason: "pub/sub channel unavailable".to_string(),
            }
            .into());
        }
        // No live subscriber is not an error for pub/sub.
        let _ = self.tx.send(payload.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Append-only log with 1-based positions.
#[derive(Default)]
pub struct InMemoryLog {
    records: Mutex<Vec<LogRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: appends and reads fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InvalidationLog for InMemoryLog {
    async fn append(&self, key: &str, payload: &str) -> RefdataResult<u64> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::LogAppendFailed {
                key: key.to_string(),
                reason: "log unavailable".to_string(),
            }
            .into());
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let position = records.len() as u64 + 1;
        records.push(LogRecord {
            position,
            key: key.to_string(),
            payload: payload.to_string(),
        });
        Ok(position)
    }

    async fn read_after(&self, position: u64, limit: usize) -> RefdataResult<Vec<LogRecord>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::LogReadFailed {
                reason: "log unavailable".to_string(),
            }
            .into());
        }
        let records = self
            .records
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(records.len());
        Ok(records[start..].iter().take(limit).cloned().collect())
    }
}
