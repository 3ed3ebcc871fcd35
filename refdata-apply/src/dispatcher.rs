//! Per-partition command dispatcher
//!
//! One unbounded queue and one worker task per `tenant:dict` partition,
//! created on first use. Commands of a partition are applied one at a time
//! in arrival order; partitions run concurrently.

use crate::processor::ApplyProcessor;
use crate::publisher::CommandPublisher;
use async_trait::async_trait;
use dashmap::DashMap;
use refdata_core::{ApplyError, DispatcherConfig, RefdataResult, UpdateCommand};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Commands accepted onto a queue
    pub dispatched: AtomicU64,
    /// Commands whose apply pass returned
    pub processed: AtomicU64,
    /// Commands whose apply pass failed and went down the fail path
    pub failed: AtomicU64,
}

impl DispatcherMetrics {
    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    pub dispatched: u64,
    pub processed: u64,
    pub failed: u64,
}

// ============================================================================
// DISPATCHER
// ============================================================================

struct DispatcherInner {
    processor: Arc<ApplyProcessor>,
    config: DispatcherConfig,
    queues: DashMap<String, mpsc::UnboundedSender<UpdateCommand>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    metrics: Arc<DispatcherMetrics>,
}

/// Routes commands to their partition's worker. Cheap to clone.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CommandDispatcher {
    pub fn new(processor: Arc<ApplyProcessor>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                processor,
                config,
                queues: DashMap::new(),
                workers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                metrics: Arc::new(DispatcherMetrics::default()),
            }),
        }
    }

    pub fn metrics(&self) -> DispatcherSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn partition_count(&self) -> usize {
        self.inner.queues.len()
    }

    /// Enqueue `command` on its partition and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, command: UpdateCommand) -> RefdataResult<()> {
        let partition_key = command.partition_key();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ApplyError::DispatcherClosed { partition_key }.into());
        }

        let existing = self
            .inner
            .queues
            .get(&partition_key)
            .map(|sender| sender.value().clone());
        let sender = match existing {
            Some(sender) => sender,
            None => self.open_partition(&partition_key)?,
        };

        sender
            .send(command)
            .map_err(|_| ApplyError::DispatcherClosed {
                partition_key: partition_key.clone(),
            })?;
        self.inner.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(partition = %partition_key, "Command dispatched");
        Ok(())
    }

    /// Create the partition's queue and worker. The `workers` lock orders
    /// this against `shutdown`: either the handle is collected there, or
    /// the closed flag is seen here.
    fn open_partition(
        &self,
        partition_key: &str,
    ) -> RefdataResult<mpsc::UnboundedSender<UpdateCommand>> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ApplyError::DispatcherClosed {
                partition_key: partition_key.to_string(),
            }
            .into());
        }

        let sender = self
            .inner
            .queues
            .entry(partition_key.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                workers.push(tokio::spawn(run_partition(
                    Arc::clone(&self.inner.processor),
                    Arc::clone(&self.inner.metrics),
                    partition_key.to_string(),
                    rx,
                )));
                tracing::debug!(partition = %partition_key, "Partition worker started");
                tx
            })
            .clone();
        Ok(sender)
    }

    /// Stop accepting commands and let every queue drain, bounded by
    /// `shutdown_timeout`. Returns false if the bound was exceeded; the
    /// remaining workers keep running detached.
    pub async fn shutdown(&self) -> bool {
        let handles: Vec<_> = {
            let mut workers = self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.closed.store(true, Ordering::Release);
            // Dropping the senders ends each worker once its queue is empty.
            self.inner.queues.clear();
            std::mem::take(&mut *workers)
        };
        let total = handles.len();
        let deadline = Instant::now() + self.inner.config.shutdown_timeout;

        let mut drained = 0;
        for handle in handles {
            match timeout_at(deadline, handle).await {
                Ok(Ok(())) => drained += 1,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Partition worker ended abnormally");
                    drained += 1;
                }
                Err(_) => break,
            }
        }

        if drained < total {
            tracing::warn!(
                drained,
                pending = total - drained,
                timeout_ms = self.inner.config.shutdown_timeout.as_millis() as u64,
                "Dispatcher shutdown bound exceeded; queued commands may still be applying"
            );
            return false;
        }
        let snapshot = self.metrics();
        tracing::info!(
            partitions = total,
            dispatched = snapshot.dispatched,
            processed = snapshot.processed,
            failed = snapshot.failed,
            "Dispatcher drained"
        );
        true
    }
}

#[async_trait]
impl CommandPublisher for CommandDispatcher {
    async fn publish(&self, command: UpdateCommand) -> RefdataResult<()> {
        self.dispatch(command)
    }
}

/// Worker loop of one partition. Errors are contained per command.
async fn run_partition(
    processor: Arc<ApplyProcessor>,
    metrics: Arc<DispatcherMetrics>,
    partition_key: String,
    mut rx: mpsc::UnboundedReceiver<UpdateCommand>,
) {
    while let Some(command) = rx.recv().await {
        match processor.process(&command).await {
            Ok(outcome) => {
                tracing::trace!(
                    partition = %partition_key,
                    event_id = %command.event_id,
                    outcome = ?outcome,
                    "Command applied"
                );
            }
            Err(e) => {
                metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    partition = %partition_key,
                    tenant_id = %command.tenant_id,
                    event_id = %command.event_id,
                    error = %e,
                    "Apply failed"
                );
                if let Err(fail_err) = processor.fail(&command, &e.to_string()).await {
                    tracing::error!(
                        partition = %partition_key,
                        event_id = %command.event_id,
                        error = %fail_err,
                        "Could not record apply failure"
                    );
                }
            }
        }
        metrics.processed.fetch_add(1, Ordering::Relaxed);
    }
    tracing::debug!(partition = %partition_key, "Partition worker stopped");
}
