//! Read-side dictionary cache with version-barrier reads.
//!
//! Each (tenant, dictionary) bucket publishes its current [`CacheSnapshot`]
//! through a `watch` channel and owns a reload guard. Reloads are
//! non-blocking: if another task holds the guard, the caller skips and relies
//! on that reload becoming visible. Barrier readers do not give up on a
//! skipped reload; they wait for the next snapshot swap (or a short tick) and
//! try again until their deadline, then fall back to a one-shot store read.

use super::snapshot::{CacheSnapshot, ItemRead, QueryReadResult};
use crate::provider::{DictionaryProvider, ProviderRouter};
use dashmap::DashMap;
use refdata_core::{
    ConsistencyError, DictionaryKey, DictionaryRegistry, InvalidationEvent, InvalidationListener,
    ItemMap, NotFoundError, QueryConfig, RefdataResult, ValidationError, Version,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, trace, warn};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct QueryCacheMetrics {
    /// Reads answered from memory
    pub memory_reads: AtomicU64,
    /// Barrier reads answered by a direct store read
    pub store_fallbacks: AtomicU64,
    /// Barrier reads rejected because the version is not committed anywhere
    pub barrier_rejections: AtomicU64,
    /// Snapshot swaps
    pub reloads: AtomicU64,
    /// Background reloads that failed
    pub reload_failures: AtomicU64,
}

impl QueryCacheMetrics {
    pub fn snapshot(&self) -> QueryCacheSnapshot {
        QueryCacheSnapshot {
            memory_reads: self.memory_reads.load(Ordering::Relaxed),
            store_fallbacks: self.store_fallbacks.load(Ordering::Relaxed),
            barrier_rejections: self.barrier_rejections.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueryCacheMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheSnapshot {
    pub memory_reads: u64,
    pub store_fallbacks: u64,
    pub barrier_rejections: u64,
    pub reloads: u64,
    pub reload_failures: u64,
}

// ============================================================================
// BUCKET
// ============================================================================

struct CacheBucket {
    snapshot: watch::Sender<Arc<CacheSnapshot>>,
    reload_guard: Mutex<()>,
    loaded: AtomicBool,
}

impl CacheBucket {
    fn new() -> Self {
        Self {
            snapshot: watch::Sender::new(Arc::new(CacheSnapshot::default())),
            reload_guard: Mutex::new(()),
            loaded: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    fn version(&self) -> Version {
        self.snapshot.borrow().version
    }

    /// Swap in a newer snapshot. Older or equal versions are ignored, so the
    /// published version never moves backwards.
    fn publish(&self, version: Version, items: ItemMap) -> bool {
        self.snapshot.send_if_modified(|current| {
            if version > current.version {
                *current = Arc::new(CacheSnapshot::new(version, items));
                true
            } else {
                false
            }
        })
    }
}

// ============================================================================
// QUERY CACHE
// ============================================================================

struct QueryCacheInner {
    registry: Arc<DictionaryRegistry>,
    providers: ProviderRouter,
    config: QueryConfig,
    buckets: DashMap<DictionaryKey, Arc<CacheBucket>>,
    reload_permits: Arc<Semaphore>,
    metrics: QueryCacheMetrics,
}

/// Per-(tenant, dictionary) in-memory cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<QueryCacheInner>,
}

impl QueryCache {
    pub fn new(
        registry: Arc<DictionaryRegistry>,
        providers: ProviderRouter,
        config: QueryConfig,
        reload_parallelism: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueryCacheInner {
                registry,
                providers,
                config,
                buckets: DashMap::new(),
                reload_permits: Arc::new(Semaphore::new(reload_parallelism.max(1))),
                metrics: QueryCacheMetrics::default(),
            }),
        }
    }

    pub fn metrics(&self) -> QueryCacheSnapshot {
        self.inner.metrics.snapshot()
    }

    fn resolve(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<DictionaryKey> {
        if tenant_id.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "tenantId".to_string(),
            }
            .into());
        }
        let code = self.inner.registry.canonical_code(dict_code)?;
        Ok(DictionaryKey::new(tenant_id, code))
    }

    fn bucket(&self, key: &DictionaryKey) -> Arc<CacheBucket> {
        if let Some(bucket) = self.inner.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        Arc::clone(
            self.inner
                .buckets
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CacheBucket::new()))
                .value(),
        )
    }

    fn provider(&self, key: &DictionaryKey) -> Arc<dyn DictionaryProvider> {
        self.inner.providers.for_dictionary(key.dict_code())
    }

    /// First access loads the bucket, waiting for the guard if needed.
    async fn ensure_loaded(&self, key: &DictionaryKey, bucket: &CacheBucket) -> RefdataResult<()> {
        if bucket.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = bucket.reload_guard.lock().await;
        if bucket.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let (version, items) = self
            .provider(key)
            .load_versioned(key.tenant_id(), key.dict_code())
            .await?;
        if bucket.publish(version, items) {
            self.inner.metrics.reloads.fetch_add(1, Ordering::Relaxed);
        }
        bucket.loaded.store(true, Ordering::Release);
        debug!(partition = %key, version, "Cache bucket loaded");
        Ok(())
    }

    /// Reload a bucket from the store if it is behind `target`.
    ///
    /// Returns true if a newer snapshot was swapped in. Skips when the bucket
    /// already satisfies `target`, when another reload holds the guard, or
    /// when the store is not ahead of the cache.
    pub async fn reload_if_needed(&self, key: &DictionaryKey, target: Version) -> RefdataResult<bool> {
        let bucket = self.bucket(key);
        if bucket.version() >= target {
            return Ok(false);
        }
        let Ok(_guard) = bucket.reload_guard.try_lock() else {
            trace!(partition = %key, target, "Reload already in flight, skipping");
            return Ok(false);
        };
        let current = bucket.version();
        if current >= target {
            return Ok(false);
        }

        let provider = self.provider(key);
        let committed = provider
            .committed_version(key.tenant_id(), key.dict_code())
            .await?;
        if committed <= current {
            return Ok(false);
        }

        let (version, items) = provider
            .load_versioned(key.tenant_id(), key.dict_code())
            .await?;
        let swapped = bucket.publish(version, items);
        bucket.loaded.store(true, Ordering::Release);
        if swapped {
            self.inner.metrics.reloads.fetch_add(1, Ordering::Relaxed);
            debug!(partition = %key, from = current, to = version, "Cache snapshot swapped");
        }
        Ok(swapped)
    }

    /// Queue a reload on the bounded background pool.
    fn schedule_reload(&self, key: DictionaryKey, target: Version) {
        let Ok(handle) = Handle::try_current() else {
            warn!(partition = %key, target, "No runtime available, dropping background reload");
            return;
        };
        let cache = self.clone();
        let permits = Arc::clone(&self.inner.reload_permits);
        handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = cache.reload_if_needed(&key, target).await {
                cache
                    .inner
                    .metrics
                    .reload_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(partition = %key, target, error = %e, "Background cache reload failed");
            }
        });
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read all items, honoring an optional version barrier.
    ///
    /// Without a barrier, or when the cache already satisfies it, this
    /// answers from memory immediately. Otherwise it keeps trying to reload
    /// until `wait_for_reload` elapses, then reads the store directly if the
    /// store has committed `min_version`, and fails with
    /// `VersionNotCommitted` if it has not.
    pub async fn read_all(
        &self,
        tenant_id: &str,
        dict_code: &str,
        min_version: Option<Version>,
    ) -> RefdataResult<QueryReadResult> {
        let key = self.resolve(tenant_id, dict_code)?;
        let bucket = self.bucket(&key);
        self.ensure_loaded(&key, &bucket).await?;

        let snapshot = bucket.current();
        let min = match min_version {
            Some(min) if snapshot.version < min => min,
            _ => {
                self.inner.metrics.memory_reads.fetch_add(1, Ordering::Relaxed);
                return Ok(QueryReadResult::from_memory(&snapshot));
            }
        };

        if let Some(snapshot) = self.wait_for_version(&key, &bucket, min).await {
            self.inner.metrics.memory_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(QueryReadResult::from_memory(&snapshot));
        }

        self.read_from_store(key, min).await
    }

    async fn wait_for_version(
        &self,
        key: &DictionaryKey,
        bucket: &CacheBucket,
        min: Version,
    ) -> Option<Arc<CacheSnapshot>> {
        let deadline = Instant::now() + self.inner.config.wait_for_reload;
        let mut rx = bucket.snapshot.subscribe();
        loop {
            if let Err(e) = self.reload_if_needed(key, min).await {
                warn!(partition = %key, min_version = min, error = %e, "Barrier reload failed");
            }
            let snapshot = Arc::clone(&rx.borrow_and_update());
            if snapshot.version >= min {
                return Some(snapshot);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let tick = (deadline - now).min(self.inner.config.reload_poll_interval);
            let _ = timeout(tick, rx.changed()).await;
        }
    }

    async fn read_from_store(&self, key: DictionaryKey, min: Version) -> RefdataResult<QueryReadResult> {
        let provider = self.provider(&key);
        let committed = provider
            .committed_version(key.tenant_id(), key.dict_code())
            .await?;
        if committed < min {
            self.inner
                .metrics
                .barrier_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(ConsistencyError::VersionNotCommitted {
                requested: min,
                committed,
            }
            .into());
        }

        let (version, items) = provider
            .load_versioned(key.tenant_id(), key.dict_code())
            .await?;
        self.inner
            .metrics
            .store_fallbacks
            .fetch_add(1, Ordering::Relaxed);
        debug!(partition = %key, min_version = min, version, "Served barrier read from store");
        self.schedule_reload(key, version);
        Ok(QueryReadResult::from_store(version, items))
    }

    /// Read one item. A missing key is `NotFoundError::Item`.
    pub async fn read_item(
        &self,
        tenant_id: &str,
        dict_code: &str,
        key: &str,
        min_version: Option<Version>,
    ) -> RefdataResult<ItemRead> {
        let read = self.read_all(tenant_id, dict_code, min_version).await?;
        match read.items.get(key) {
            Some(value) => Ok(ItemRead {
                version: read.version,
                source: read.source,
                key: key.to_string(),
                value: value.clone(),
            }),
            None => Err(NotFoundError::Item {
                tenant_id: tenant_id.to_string(),
                dict_code: dict_code.to_string(),
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Read several items. Missing keys are omitted.
    pub async fn read_items<'a>(
        &self,
        tenant_id: &str,
        dict_code: &str,
        keys: impl IntoIterator<Item = &'a str>,
        min_version: Option<Version>,
    ) -> RefdataResult<QueryReadResult> {
        let read = self.read_all(tenant_id, dict_code, min_version).await?;
        Ok(read.project(keys))
    }

    /// Cached version, loading the bucket on first access.
    pub async fn current_version(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<Version> {
        let key = self.resolve(tenant_id, dict_code)?;
        let bucket = self.bucket(&key);
        self.ensure_loaded(&key, &bucket).await?;
        Ok(bucket.version())
    }
}

impl InvalidationListener for QueryCache {
    fn on_invalidation(&self, event: &InvalidationEvent) {
        let Some(dict) = self.inner.registry.get(&event.dict_code) else {
            debug!(dict_code = %event.dict_code, "Ignoring invalidation for unregistered dictionary");
            return;
        };
        let key = DictionaryKey::new(event.tenant_id.clone(), dict.code.clone());
        trace!(partition = %key, version = event.version, "Invalidation received");
        self.schedule_reload(key, event.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatformStore;
    use crate::provider::GenericItemProvider;
    use crate::repository;
    use crate::store::PlatformStore;
    use refdata_core::{DataSource, DictionaryConfig, RefdataError};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryPlatformStore>,
        cache: QueryCache,
    }

    fn fixture(wait: Duration) -> Fixture {
        let store = Arc::new(InMemoryPlatformStore::new());
        let registry = Arc::new(DictionaryRegistry::new(&[DictionaryConfig::enabled("COUNTRY")]));
        let provider: Arc<dyn DictionaryProvider> = Arc::new(GenericItemProvider::new(store.clone()));
        let config = QueryConfig {
            wait_for_reload: wait,
            reload_poll_interval: Duration::from_millis(2),
        };
        let cache = QueryCache::new(registry, ProviderRouter::new(provider), config, 2);
        Fixture { store, cache }
    }

    /// Commit one version writing `items` on top of the current set.
    async fn commit(store: &InMemoryPlatformStore, items: &[(&str, Value)]) -> Version {
        let mut tx = store.begin().await.unwrap();
        let version = repository::allocate_next_version(tx.as_mut(), "t", "COUNTRY", None)
            .await
            .unwrap();
        for (key, value) in items {
            tx.upsert_item("t", "COUNTRY", key, value, version).await.unwrap();
        }
        tx.commit().await.unwrap();
        version
    }

    #[tokio::test]
    async fn test_first_read_loads_committed_state() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!({"name": "Russia"}))]).await;

        let read = f.cache.read_all("t", "country", None).await.unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.source, DataSource::Memory);
        assert!(read.items.contains_key("RU"));
    }

    #[tokio::test]
    async fn test_satisfied_barrier_served_from_memory() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!(1))]).await;
        let read = f.cache.read_all("t", "COUNTRY", Some(1)).await.unwrap();
        assert_eq!(read.source, DataSource::Memory);
        assert_eq!(f.cache.metrics().store_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_barrier_ahead_of_cache_triggers_reload() {
        let f = fixture(Duration::from_millis(50));
        commit(&f.store, &[("RU", json!(1))]).await;
        assert_eq!(f.cache.current_version("t", "COUNTRY").await.unwrap(), 1);

        let v2 = commit(&f.store, &[("US", json!(2))]).await;
        let read = f.cache.read_all("t", "COUNTRY", Some(v2)).await.unwrap();
        assert_eq!(read.version, 2);
        assert_eq!(read.source, DataSource::Memory);
        assert!(read.items.contains_key("US"));
    }

    #[tokio::test]
    async fn test_barrier_above_store_is_version_not_committed() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!(1))]).await;

        let started = Instant::now();
        let err = f.cache.read_all("t", "COUNTRY", Some(5)).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(
            err,
            RefdataError::Consistency(ConsistencyError::VersionNotCommitted {
                requested: 5,
                committed: 1,
            })
        );
        assert_eq!(f.cache.metrics().barrier_rejections, 1);
    }

    #[tokio::test]
    async fn test_fallback_serves_store_when_reload_is_blocked() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!(1))]).await;
        f.cache.current_version("t", "COUNTRY").await.unwrap();
        commit(&f.store, &[("US", json!(2))]).await;

        let key = DictionaryKey::new("t", "COUNTRY");
        let bucket = f.cache.bucket(&key);
        let guard = bucket.reload_guard.lock().await;

        let read = f.cache.read_all("t", "COUNTRY", Some(2)).await.unwrap();
        assert_eq!(read.source, DataSource::StoreFallback);
        assert_eq!(read.version, 2);
        assert!(read.items.contains_key("US"));

        drop(guard);
        let deadline = Instant::now() + Duration::from_secs(1);
        while f.cache.current_version("t", "COUNTRY").await.unwrap() < 2 {
            assert!(Instant::now() < deadline, "background refresh never landed");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_read_item_and_items() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!(1)), ("US", json!(2))]).await;

        let item = f.cache.read_item("t", "COUNTRY", "RU", None).await.unwrap();
        assert_eq!(item.value, json!(1));

        let err = f.cache.read_item("t", "COUNTRY", "XX", None).await.unwrap_err();
        assert!(matches!(err, RefdataError::NotFound(NotFoundError::Item { .. })));

        let many = f
            .cache
            .read_items("t", "COUNTRY", ["US", "XX"], None)
            .await
            .unwrap();
        assert_eq!(many.items.keys().collect::<Vec<_>>(), vec!["US"]);
    }

    #[tokio::test]
    async fn test_unknown_dictionary_is_not_found() {
        let f = fixture(Duration::from_millis(20));
        let err = f.cache.read_all("t", "CURRENCY", None).await.unwrap_err();
        assert!(matches!(err, RefdataError::NotFound(NotFoundError::Dictionary { .. })));
    }

    #[tokio::test]
    async fn test_invalidation_reloads_in_background() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!(1))]).await;
        assert_eq!(f.cache.current_version("t", "COUNTRY").await.unwrap(), 1);

        let v2 = commit(&f.store, &[("US", json!(2))]).await;
        f.cache
            .on_invalidation(&InvalidationEvent::new("e-2", "t", "COUNTRY", v2));

        let deadline = Instant::now() + Duration::from_secs(1);
        while f.cache.current_version("t", "COUNTRY").await.unwrap() < v2 {
            assert!(Instant::now() < deadline, "invalidation never applied");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_reload_failure_releases_guard() {
        let f = fixture(Duration::from_millis(20));
        commit(&f.store, &[("RU", json!(1))]).await;
        f.cache.current_version("t", "COUNTRY").await.unwrap();
        commit(&f.store, &[("US", json!(2))]).await;

        let key = DictionaryKey::new("t", "COUNTRY");
        f.store.set_available(false);
        assert!(f.cache.reload_if_needed(&key, 2).await.is_err());
        f.store.set_available(true);
        assert!(f.cache.reload_if_needed(&key, 2).await.unwrap());
    }

    #[test]
    fn test_publish_never_moves_backwards() {
        let bucket = CacheBucket::new();
        assert!(bucket.publish(3, ItemMap::new()));
        assert!(!bucket.publish(2, ItemMap::new()));
        assert!(!bucket.publish(3, ItemMap::new()));
        assert_eq!(bucket.version(), 3);
    }
}
