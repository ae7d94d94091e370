// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure layer for cim-reconcile
//!
//! The external collaborators of the reconciliation core:
//! - the upstream event store and an in-memory implementation of it
//! - snapshot storage in memory and on a JetStream key/value bucket

pub mod event_store;
pub mod jetstream_snapshot_store;
pub mod memory_event_store;
pub mod snapshot_store;

pub use event_store::{EventBatchStream, EventStore, EventStoreError, QueryOrder};
pub use jetstream_snapshot_store::{JetStreamSnapshotConfig, JetStreamSnapshotStore};
pub use memory_event_store::InMemoryEventStore;
pub use snapshot_store::{InMemorySnapshotStore, SnapshotError, SnapshotStore};
