//! Full write-then-read scenarios against a running node, over both bus kinds.

use refdata_apply::UpdateSubmission;
use refdata_core::{BusKind, DataSource, RefdataConfig};
use refdata_node::RefdataNode;
use refdata_test_utils::assertions::{
    assert_dictionary_not_found, assert_version_not_committed, eventually, keys,
    wait_for_terminal,
};
use refdata_test_utils::fixtures::{
    chunked_snapshot, country, country_delta, country_snapshot, fast_config, COUNTRY, TENANT,
};
use refdata_test_utils::{PlatformStore, RefdataError, UpdateCommand, UpdateStatus};
use serde_json::json;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(2);

fn started_node(kind: BusKind) -> RefdataNode {
    let mut config: RefdataConfig = fast_config();
    config.bus.kind = kind;
    let node = RefdataNode::new(config).unwrap();
    node.start();
    node
}

async fn async_delta_is_readable_with_barrier(kind: BusKind) {
    let node = started_node(kind);
    let receipt = node
        .submit(UpdateSubmission::fire_and_forget(country_delta(vec![country(
            "RU", "Russia",
        )])))
        .await
        .unwrap();
    assert_eq!(receipt.status, UpdateStatus::Pending);
    assert!(receipt.committed_version.is_none());

    let request = wait_for_terminal(node.store().as_ref(), TENANT, &receipt.event_id, SETTLE)
        .await
        .unwrap();
    assert_eq!(request.status, UpdateStatus::Committed);
    let version = request.committed_version.unwrap();
    assert_eq!(version, 1);

    let item = node
        .read_item(TENANT, COUNTRY, "RU", Some(version))
        .await
        .unwrap();
    assert!(item.version >= version);
    assert_eq!(item.value, json!({ "name": "Russia" }));

    node.shutdown().await;
}

#[tokio::test]
async fn test_async_delta_then_barrier_read_local() {
    async_delta_is_readable_with_barrier(BusKind::Local).await;
}

#[tokio::test]
async fn test_async_delta_then_barrier_read_durable() {
    async_delta_is_readable_with_barrier(BusKind::Durable).await;
}

#[tokio::test]
async fn test_wait_commit_snapshot_replaces_dictionary() {
    let node = started_node(BusKind::Local);
    node.submit(UpdateSubmission::wait_commit(country_delta(vec![
        country("RU", "Russia"),
        country("US", "United States"),
    ])))
    .await
    .unwrap();

    let receipt = node
        .submit(UpdateSubmission::wait_commit(country_snapshot(vec![
            country("RU", "Russia"),
            country("DE", "Germany"),
        ])))
        .await
        .unwrap();
    assert_eq!(receipt.status, UpdateStatus::Committed);
    assert_eq!(receipt.committed_version, Some(2));

    let read = node.read_all(TENANT, COUNTRY, Some(2)).await.unwrap();
    assert_eq!(read.version, 2);
    assert_eq!(keys(&read.items), vec!["DE", "RU"]);

    let partial = node
        .read_items(TENANT, COUNTRY, ["US", "DE"], Some(2))
        .await
        .unwrap();
    assert_eq!(keys(&partial.items), vec!["DE"]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_barrier_above_committed_is_rejected() {
    let node = started_node(BusKind::Local);
    node.submit(UpdateSubmission::wait_commit(country_delta(vec![country(
        "RU", "Russia",
    )])))
    .await
    .unwrap();

    let result = node.read_all(TENANT, COUNTRY, Some(5)).await;
    assert_version_not_committed(&result, 5, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_barrier_at_or_below_committed_answers_from_memory() {
    let node = started_node(BusKind::Local);
    for name in ["Russia", "Rossiya"] {
        node.submit(UpdateSubmission::wait_commit(country_delta(vec![country(
            "RU", name,
        )])))
        .await
        .unwrap();
    }

    // Warm the bucket at the latest version, then ask for an older one.
    node.read_all(TENANT, COUNTRY, Some(2)).await.unwrap();
    let read = node.read_all(TENANT, COUNTRY, Some(1)).await.unwrap();
    assert_eq!(read.source, DataSource::Memory);
    assert_eq!(read.version, 2);
    assert_eq!(read.items.get("RU"), Some(&json!({ "name": "Rossiya" })));

    node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_event_id_commits_once() {
    let node = started_node(BusKind::Local);
    let command = country_delta(vec![country("RU", "Russia")]).with_event_id("evt-dup");

    let first = node
        .submit(UpdateSubmission::wait_commit(command.clone()))
        .await
        .unwrap();
    let second = node
        .submit(UpdateSubmission::wait_commit(command))
        .await
        .unwrap();
    assert_eq!(first.committed_version, Some(1));
    assert_eq!(second.committed_version, Some(1));
    let meta = node
        .store()
        .dictionary_meta(TENANT, COUNTRY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.version, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_chunked_snapshot_commits_when_complete() {
    let node = started_node(BusKind::Local);
    let chunks = chunked_snapshot(
        "snap-e2e",
        vec![
            country("DE", "Germany"),
            country("FR", "France"),
            country("IT", "Italy"),
            country("ES", "Spain"),
        ],
        2,
    );

    let first = node
        .submit(UpdateSubmission::fire_and_forget(chunks[0].clone()))
        .await
        .unwrap();
    let last = node
        .submit(UpdateSubmission::wait_commit(chunks[1].clone()))
        .await
        .unwrap();
    assert_eq!(last.status, UpdateStatus::Committed);
    assert_eq!(last.committed_version, Some(1));

    let first = node.status(TENANT, &first.event_id).await.unwrap();
    assert_eq!(first.status, UpdateStatus::Committed);
    assert_eq!(first.committed_version, Some(1));

    let read = node.read_all(TENANT, COUNTRY, Some(1)).await.unwrap();
    assert_eq!(keys(&read.items), vec!["DE", "ES", "FR", "IT"]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_durable_bus_converges_cache_without_barrier() {
    let node = started_node(BusKind::Durable);
    assert_eq!(node.current_version(TENANT, COUNTRY).await.unwrap(), 0);

    node.submit(UpdateSubmission::wait_commit(country_delta(vec![country(
        "RU", "Russia",
    )])))
    .await
    .unwrap();

    let node = &node;
    let converged = eventually(SETTLE, || async move {
        node.current_version(TENANT, COUNTRY).await.ok() == Some(1)
    })
    .await;
    assert!(converged, "cache never caught up with the committed version");

    let read = node.read_all(TENANT, COUNTRY, None).await.unwrap();
    assert_eq!(read.source, DataSource::Memory);
    assert_eq!(keys(&read.items), vec!["RU"]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_unknown_dictionary_is_rejected_on_both_paths() {
    let node = started_node(BusKind::Local);
    let submit = node
        .submit(UpdateSubmission::fire_and_forget(
            UpdateCommand::delta(TENANT, "PLANET", vec![country("RU", "Russia")]),
        ))
        .await;
    assert_dictionary_not_found(&submit);
    assert_dictionary_not_found(&node.read_all(TENANT, "PLANET", None).await);
    assert_dictionary_not_found(&node.read_all(TENANT, "LEGACY", None).await);

    node.shutdown().await;
}

#[tokio::test]
async fn test_status_of_unknown_event_is_not_found() {
    let node = started_node(BusKind::Local);
    let result = node.status(TENANT, "never-submitted").await;
    assert!(matches!(result, Err(RefdataError::NotFound(_))));
    node.shutdown().await;
}
