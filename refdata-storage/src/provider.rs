//! Dictionary apply providers.
//!
//! A provider owns how one dictionary's items are materialized. The generic
//! provider keeps a key/value table; bespoke providers can map a dictionary
//! onto its own schema and are selected per dictionary through
//! [`ProviderRouter`].

use crate::repository;
use crate::store::{PlatformStore, PlatformTx};
use async_trait::async_trait;
use refdata_core::{
    ItemMap, ItemOperation, RefdataResult, UpdateCommand, UpdateItem, ValidationError, Version,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Pluggable adapter writing item-level changes into the durable store.
#[async_trait]
pub trait DictionaryProvider: Send + Sync {
    /// All committed items of a dictionary.
    async fn load_all(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<ItemMap>;

    /// Committed version, 0 if nothing was committed yet.
    async fn committed_version(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<Version>;

    /// Committed version and the items at that version.
    ///
    /// The default reads the version first, so the items are never older
    /// than the returned version.
    async fn load_versioned(
        &self,
        tenant_id: &str,
        dict_code: &str,
    ) -> RefdataResult<(Version, ItemMap)> {
        let version = self.committed_version(tenant_id, dict_code).await?;
        let items = self.load_all(tenant_id, dict_code).await?;
        Ok((version, items))
    }

    /// Apply item-level changes on top of the current item set.
    async fn apply_delta(
        &self,
        tx: &mut dyn PlatformTx,
        tenant_id: &str,
        dict_code: &str,
        items: &[UpdateItem],
        command: &UpdateCommand,
        version: Version,
    ) -> RefdataResult<()>;

    /// Replace the whole item set.
    async fn apply_snapshot(
        &self,
        tx: &mut dyn PlatformTx,
        tenant_id: &str,
        dict_code: &str,
        items: &[UpdateItem],
        command: &UpdateCommand,
        version: Version,
    ) -> RefdataResult<()>;
}

// ============================================================================
// GENERIC KEY/VALUE PROVIDER
// ============================================================================

/// Stores every dictionary in the generic item table.
pub struct GenericItemProvider {
    store: Arc<dyn PlatformStore>,
}

impl GenericItemProvider {
    pub fn new(store: Arc<dyn PlatformStore>) -> Self {
        Self { store }
    }

    async fn upsert(
        tx: &mut dyn PlatformTx,
        tenant_id: &str,
        dict_code: &str,
        item: &UpdateItem,
        version: Version,
    ) -> RefdataResult<()> {
        let payload = item.payload.as_ref().ok_or_else(|| ValidationError::InvalidValue {
            field: "items.payload".to_string(),
            reason: format!("UPSERT of '{}' requires a payload", item.key),
        })?;
        tx.upsert_item(tenant_id, dict_code, &item.key, payload, version)
            .await
    }
}

#[async_trait]
impl DictionaryProvider for GenericItemProvider {
    async fn load_all(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<ItemMap> {
        self.store.load_items(tenant_id, dict_code).await
    }

    async fn committed_version(&self, tenant_id: &str, dict_code: &str) -> RefdataResult<Version> {
        Ok(self
            .store
            .dictionary_meta(tenant_id, dict_code)
            .await?
            .map(|meta| meta.version)
            .unwrap_or(0))
    }

    /// Reads version and items in one transaction, so they always match.
    async fn load_versioned(
        &self,
        tenant_id: &str,
        dict_code: &str,
    ) -> RefdataResult<(Version, ItemMap)> {
        let mut tx = self.store.begin().await?;
        let version = repository::current_committed_version(tx.as_mut(), tenant_id, dict_code).await?;
        let items = tx.load_items(tenant_id, dict_code).await?;
        Ok((version, items))
    }

    async fn apply_delta(
        &self,
        tx: &mut dyn PlatformTx,
        tenant_id: &str,
        dict_code: &str,
        items: &[UpdateItem],
        _command: &UpdateCommand,
        version: Version,
    ) -> RefdataResult<()> {
        for item in items {
            match item.op {
                ItemOperation::Upsert => {
                    Self::upsert(tx, tenant_id, dict_code, item, version).await?;
                }
                ItemOperation::Delete => {
                    tx.delete_item(tenant_id, dict_code, &item.key).await?;
                }
            }
        }
        Ok(())
    }

    /// DELETE items inside a snapshot are ignored; absence already deletes.
    async fn apply_snapshot(
        &self,
        tx: &mut dyn PlatformTx,
        tenant_id: &str,
        dict_code: &str,
        items: &[UpdateItem],
        _command: &UpdateCommand,
        version: Version,
    ) -> RefdataResult<()> {
        tx.clear_items(tenant_id, dict_code).await?;
        for item in items.iter().filter(|i| i.op == ItemOperation::Upsert) {
            Self::upsert(tx, tenant_id, dict_code, item, version).await?;
        }
        Ok(())
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Per-dictionary provider selection with a default fallback.
#[derive(Clone)]
pub struct ProviderRouter {
    default: Arc<dyn DictionaryProvider>,
    overrides: Arc<HashMap<String, Arc<dyn DictionaryProvider>>>,
}

impl ProviderRouter {
    pub fn new(default: Arc<dyn DictionaryProvider>) -> Self {
        Self {
            default,
            overrides: Arc::new(HashMap::new()),
        }
    }

    /// Route `dict_code` (case-insensitive) to a dedicated provider.
    pub fn with_provider(mut self, dict_code: &str, provider: Arc<dyn DictionaryProvider>) -> Self {
        Arc::make_mut(&mut self.overrides).insert(dict_code.trim().to_uppercase(), provider);
        self
    }

    pub fn for_dictionary(&self, dict_code: &str) -> Arc<dyn DictionaryProvider> {
        self.overrides
            .get(&dict_code.trim().to_uppercase())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}
