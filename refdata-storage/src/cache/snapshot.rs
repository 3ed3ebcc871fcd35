//! Immutable cache snapshots and read results.

use refdata_core::{DataSource, ItemMap, Version};
use serde_json::Value;
use std::sync::Arc;

/// Items of one dictionary at one committed version.
///
/// Never mutated; the cache swaps in a new snapshot instead.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheSnapshot {
    pub version: Version,
    pub items: Arc<ItemMap>,
}

impl CacheSnapshot {
    pub fn new(version: Version, items: ItemMap) -> Self {
        Self {
            version,
            items: Arc::new(items),
        }
    }

    pub fn satisfies(&self, min_version: Option<Version>) -> bool {
        min_version.map_or(true, |min| self.version >= min)
    }
}

/// Result of a (possibly version-barriered) dictionary read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryReadResult {
    pub version: Version,
    pub source: DataSource,
    pub items: Arc<ItemMap>,
}

impl QueryReadResult {
    pub fn from_memory(snapshot: &CacheSnapshot) -> Self {
        Self {
            version: snapshot.version,
            source: DataSource::Memory,
            items: Arc::clone(&snapshot.items),
        }
    }

    pub fn from_store(version: Version, items: ItemMap) -> Self {
        Self {
            version,
            source: DataSource::StoreFallback,
            items: Arc::new(items),
        }
    }

    /// Keep only `keys`; missing keys are omitted.
    pub fn project<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let items: ItemMap = keys
            .into_iter()
            .filter_map(|k| self.items.get(k).map(|v| (k.to_string(), v.clone())))
            .collect();
        Self {
            version: self.version,
            source: self.source,
            items: Arc::new(items),
        }
    }
}

/// Result of a single-item read.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRead {
    pub version: Version,
    pub source: DataSource,
    pub key: String,
    pub value: Value,
}
