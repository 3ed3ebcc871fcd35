//! REFDATA Test Utilities
//!
//! Shared test infrastructure for the REFDATA workspace:
//! - Proptest generators for commands, items and invalidation events
//! - Fixtures for dictionaries, configuration and common commands
//! - A recording invalidation listener
//! - Custom assertions and async wait helpers

pub use refdata_core::{
    DictionaryConfig, DictionaryRegistry, EventType, InvalidationEvent, InvalidationListener,
    ItemMap, ItemOperation, NotFoundError, RefdataConfig, RefdataError, RefdataResult,
    UpdateCommand, UpdateItem, UpdateRequest, UpdateStatus, ValidationError, Version,
};
pub use refdata_storage::{InMemoryPlatformStore, PlatformStore};

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// RECORDING LISTENER
// ============================================================================

/// Invalidation listener that remembers every event it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<InvalidationEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<InvalidationEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Versions received for one partition, in arrival order.
    pub fn versions_for(&self, tenant_id: &str, dict_code: &str) -> Vec<Version> {
        self.events()
            .into_iter()
            .filter(|e| e.tenant_id == tenant_id && e.dict_code == dict_code)
            .map(|e| e.version)
            .collect()
    }
}

impl InvalidationListener for RecordingListener {
    fn on_invalidation(&self, event: &InvalidationEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for REFDATA types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_tenant_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{2,8}"
    }

    /// One of the fixture dictionaries, in random case.
    pub fn arb_dict_code() -> impl Strategy<Value = String> {
        prop_oneof![Just(fixtures::COUNTRY), Just(fixtures::CURRENCY)].prop_flat_map(|code| {
            any::<bool>().prop_map(move |lower| {
                if lower {
                    code.to_lowercase()
                } else {
                    code.to_string()
                }
            })
        })
    }

    pub fn arb_item_key() -> impl Strategy<Value = String> {
        "[A-Z]{2,3}"
    }

    pub fn arb_payload() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z ]{0,16}".prop_map(Value::from),
            ("[a-zA-Z ]{1,16}", any::<bool>())
                .prop_map(|(name, active)| json!({ "name": name, "active": active })),
        ]
    }

    pub fn arb_upsert_item() -> impl Strategy<Value = UpdateItem> {
        (arb_item_key(), arb_payload()).prop_map(|(key, payload)| UpdateItem::upsert(key, payload))
    }

    pub fn arb_update_item() -> impl Strategy<Value = UpdateItem> {
        prop_oneof![
            3 => arb_upsert_item(),
            1 => arb_item_key().prop_map(UpdateItem::delete),
        ]
    }

    pub fn arb_delta_items() -> impl Strategy<Value = Vec<UpdateItem>> {
        prop::collection::vec(arb_update_item(), 0..8)
    }

    /// Items with distinct keys, as a snapshot would carry.
    pub fn arb_snapshot_items() -> impl Strategy<Value = Vec<UpdateItem>> {
        prop::collection::btree_map(arb_item_key(), arb_payload(), 0..12).prop_map(|items| {
            items
                .into_iter()
                .map(|(key, payload)| UpdateItem::upsert(key, payload))
                .collect()
        })
    }

    pub fn arb_delta_command() -> impl Strategy<Value = UpdateCommand> {
        (arb_tenant_id(), arb_dict_code(), arb_delta_items())
            .prop_map(|(tenant, dict, items)| UpdateCommand::delta(tenant, dict, items))
    }

    pub fn arb_invalidation_event() -> impl Strategy<Value = InvalidationEvent> {
        (arb_tenant_id(), arb_dict_code(), 1i64..10_000).prop_map(|(tenant, dict, version)| {
            InvalidationEvent::new(refdata_core::new_event_id(), tenant, dict, version)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    pub const TENANT: &str = "tenant-a";
    pub const COUNTRY: &str = "COUNTRY";
    pub const CURRENCY: &str = "CURRENCY";

    pub fn dictionaries() -> Vec<DictionaryConfig> {
        vec![
            DictionaryConfig::enabled(COUNTRY),
            DictionaryConfig::enabled(CURRENCY),
            DictionaryConfig::disabled("LEGACY"),
        ]
    }

    pub fn registry() -> Arc<DictionaryRegistry> {
        Arc::new(DictionaryRegistry::new(&dictionaries()))
    }

    /// Defaults with short timers so tests settle quickly.
    pub fn fast_config() -> RefdataConfig {
        let mut config = RefdataConfig {
            dictionaries: dictionaries(),
            ..RefdataConfig::default()
        };
        config.consistency.wait_commit_timeout = Duration::from_millis(500);
        config.consistency.commit_poll_interval = Duration::from_millis(5);
        config.query.wait_for_reload = Duration::from_millis(50);
        config.query.reload_poll_interval = Duration::from_millis(2);
        config.outbox.poll_interval = Duration::from_millis(5);
        config.bus.recovery_poll_interval = Duration::from_millis(100);
        config.dispatcher.shutdown_timeout = Duration::from_secs(2);
        config
    }

    pub fn country(code: &str, name: &str) -> UpdateItem {
        UpdateItem::upsert(code, json!({ "name": name }))
    }

    pub fn country_delta(items: Vec<UpdateItem>) -> UpdateCommand {
        UpdateCommand::delta(TENANT, COUNTRY, items)
    }

    pub fn country_snapshot(items: Vec<UpdateItem>) -> UpdateCommand {
        UpdateCommand::snapshot(TENANT, COUNTRY, items)
    }

    /// Split `items` into `chunks` SNAPSHOT commands of one snapshot,
    /// indexed 1..=chunks. Trailing chunks may be empty.
    pub fn chunked_snapshot(
        snapshot_id: &str,
        items: Vec<UpdateItem>,
        chunks: u32,
    ) -> Vec<UpdateCommand> {
        let chunks = chunks.max(1);
        let per_chunk = items.len().div_ceil(chunks as usize).max(1);
        let mut remaining = items.into_iter();
        (1..=chunks)
            .map(|index| {
                let part: Vec<_> = remaining.by_ref().take(per_chunk).collect();
                country_snapshot(part).with_chunk(snapshot_id, index, chunks)
            })
            .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for REFDATA-specific validation.

    use super::*;
    use refdata_core::ConsistencyError;
    use std::future::Future;
    use tokio::time::Instant;

    /// Assert versions are 1, 2, 3, ... with no gap or repeat.
    #[track_caller]
    pub fn assert_gapless(versions: &[Version]) {
        let mut sorted = versions.to_vec();
        sorted.sort_unstable();
        let expected: Vec<Version> = (1..=versions.len() as Version).collect();
        assert_eq!(sorted, expected, "versions are not gapless from 1: {:?}", versions);
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &RefdataResult<T>) {
        match result {
            Err(RefdataError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_dictionary_not_found<T: std::fmt::Debug>(result: &RefdataResult<T>) {
        match result {
            Err(RefdataError::NotFound(NotFoundError::Dictionary { .. })) => {}
            other => panic!("Expected unknown dictionary, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_version_not_committed<T: std::fmt::Debug>(
        result: &RefdataResult<T>,
        requested: Version,
        committed: Version,
    ) {
        match result {
            Err(RefdataError::Consistency(ConsistencyError::VersionNotCommitted {
                requested: r,
                committed: c,
            })) => {
                assert_eq!((*r, *c), (requested, committed), "wrong barrier versions");
            }
            other => panic!(
                "Expected VersionNotCommitted({}, {}), got: {:?}",
                requested, committed, other
            ),
        }
    }

    /// Keys of an item map, in order.
    pub fn keys(items: &ItemMap) -> Vec<&str> {
        items.keys().map(String::as_str).collect()
    }

    /// Poll `check` every few milliseconds until it holds or `within` passes.
    pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + within;
        loop {
            if check().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the request reaches a terminal status.
    pub async fn wait_for_terminal(
        store: &dyn PlatformStore,
        tenant_id: &str,
        event_id: &str,
        within: Duration,
    ) -> Option<UpdateRequest> {
        let deadline = Instant::now() + within;
        loop {
            if let Ok(Some(request)) = store.find_update_request(tenant_id, event_id).await {
                if request.is_terminal() {
                    return Some(request);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
