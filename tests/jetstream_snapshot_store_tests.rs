// Copyright 2025 Cowboy AI, LLC.

//! Integration tests for JetStreamSnapshotStore
//!
//! These tests require a running NATS server with JetStream enabled.
//! Run with: `nats-server -js` and `cargo test -- --ignored`

use cim_reconcile::{
    AggregateId, JetStreamSnapshotConfig, JetStreamSnapshotStore, LocalSnapshot, OrderKey, SerializedSnapshot,
    SnapshotStore,
};
use uuid::Uuid;

async fn create_store() -> JetStreamSnapshotStore {
    let client = async_nats::connect("nats://localhost:4222")
        .await
        .expect("NATS server on localhost:4222");
    let config = JetStreamSnapshotConfig {
        bucket: format!("test-snapshots-{}", Uuid::new_v4().simple()),
        ..Default::default()
    };
    JetStreamSnapshotStore::connect(client, &config).await.unwrap()
}

fn snapshot(lamport: u64, state: &str) -> SerializedSnapshot {
    let key = OrderKey::new(lamport, "peer-1", lamport);
    let mut snapshot = LocalSnapshot::initial(state.to_string());
    snapshot.watermarks.update_from(&key);
    snapshot.order_key = key;
    snapshot.cycle = lamport;
    snapshot
}

#[tokio::test]
#[ignore = "requires NATS with JetStream"]
async fn test_store_and_retrieve_latest() {
    let store = create_store().await;
    let aggregate = AggregateId::new("inventory", "warehouse.north", 1);

    assert!(store.retrieve(&aggregate).await.unwrap().is_none());
    assert!(store.store(&aggregate, "10", &snapshot(1024, r#"{"items":3}"#)).await.unwrap());
    assert!(store.store(&aggregate, "12", &snapshot(4096, r#"{"items":9}"#)).await.unwrap());

    let latest = store.retrieve(&aggregate).await.unwrap().unwrap();
    assert_eq!(latest, snapshot(4096, r#"{"items":9}"#));
}

#[tokio::test]
#[ignore = "requires NATS with JetStream"]
async fn test_slot_rejects_older_snapshot() {
    let store = create_store().await;
    let aggregate = AggregateId::new("inventory", "w", 1);

    assert!(store.store(&aggregate, "10", &snapshot(2048, "new")).await.unwrap());
    assert!(!store.store(&aggregate, "10", &snapshot(1024, "old")).await.unwrap());
    assert_eq!(store.retrieve(&aggregate).await.unwrap().unwrap().state, "new");
}

#[tokio::test]
#[ignore = "requires NATS with JetStream"]
async fn test_versions_are_separate_but_invalidated_together() {
    let store = create_store().await;
    let v1 = AggregateId::new("inventory", "w", 1);
    let v2 = AggregateId::new("inventory", "w", 2);

    store.store(&v1, "10", &snapshot(10, "v1-early")).await.unwrap();
    store.store(&v1, "12", &snapshot(40, "v1-late")).await.unwrap();
    store.store(&v2, "10", &snapshot(40, "v2")).await.unwrap();
    assert_eq!(store.retrieve(&v2).await.unwrap().unwrap().state, "v2");

    let cutoff = OrderKey::new(20, "peer-1", 0);
    store.invalidate(&v1, &cutoff, &cutoff).await.unwrap();
    assert_eq!(store.retrieve(&v1).await.unwrap().unwrap().state, "v1-early");
    assert!(store.retrieve(&v2).await.unwrap().is_none());
}
