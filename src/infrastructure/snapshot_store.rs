// Copyright 2025 Cowboy AI, LLC.

//! Snapshot store for durable persistence of local snapshots
//!
//! Snapshots are keyed by aggregate identity and schedule tag: each tag is a
//! slot holding the most recent snapshot scheduled for it.

use crate::order_key::OrderKey;
use crate::snapshot::{AggregateId, SerializedSnapshot};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors that can occur during snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Error from underlying storage system
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Error serializing or deserializing snapshot data
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error from JetStream
    #[error("JetStream error: {0}")]
    JetStreamError(String),
}

/// Durable storage for local snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The most recent snapshot (by order key) stored for the aggregate.
    async fn retrieve(
        &self,
        aggregate: &AggregateId,
    ) -> Result<Option<SerializedSnapshot>, SnapshotError>;

    /// Store a snapshot in the slot `tag`.
    ///
    /// Returns `false` if the slot already holds a snapshot at or beyond the
    /// given one and nothing was written.
    async fn store(
        &self,
        aggregate: &AggregateId,
        tag: &str,
        snapshot: &SerializedSnapshot,
    ) -> Result<bool, SnapshotError>;

    /// Delete the snapshots of the aggregate (any version) that a conflict
    /// spanning `low..=high` invalidates.
    ///
    /// Snapshots taken before `low` are kept, as are snapshots whose horizon
    /// lies beyond `high`.
    async fn invalidate(
        &self,
        aggregate: &AggregateId,
        low: &OrderKey,
        high: &OrderKey,
    ) -> Result<(), SnapshotError>;
}

/// In-memory snapshot store for testing and single-process use
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<AggregateId, BTreeMap<String, SerializedSnapshot>>>>,
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySnapshotStore {
    /// Create a new in-memory snapshot store
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// All stored snapshots of an aggregate, by tag.
    pub async fn slots(&self, aggregate: &AggregateId) -> BTreeMap<String, SerializedSnapshot> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(aggregate).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn retrieve(
        &self,
        aggregate: &AggregateId,
    ) -> Result<Option<SerializedSnapshot>, SnapshotError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(aggregate).and_then(|slots| {
            slots
                .values()
                .max_by(|a, b| a.order_key.cmp(&b.order_key))
                .cloned()
        }))
    }

    async fn store(
        &self,
        aggregate: &AggregateId,
        tag: &str,
        snapshot: &SerializedSnapshot,
    ) -> Result<bool, SnapshotError> {
        let mut snapshots = self.snapshots.write().await;
        let slots = snapshots.entry(aggregate.clone()).or_default();
        if let Some(existing) = slots.get(tag) {
            if existing.order_key >= snapshot.order_key {
                return Ok(false);
            }
        }
        slots.insert(tag.to_string(), snapshot.clone());
        Ok(true)
    }

    async fn invalidate(
        &self,
        aggregate: &AggregateId,
        low: &OrderKey,
        high: &OrderKey,
    ) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write().await;
        for (id, slots) in snapshots.iter_mut() {
            if id.kind == aggregate.kind && id.name == aggregate.name {
                slots.retain(|_, snapshot| snapshot.survives_conflict(low, high));
            }
        }
        Ok(())
    }
}
