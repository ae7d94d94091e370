// Copyright 2025 Cowboy AI, LLC.

//! JetStream key/value snapshot store
//!
//! Every snapshot occupies two entries of one KV bucket:
//!
//! ```text
//! {kind}.{name}.v{version}.{tag}.meta    position of the snapshot (JSON)
//! {kind}.{name}.v{version}.{tag}.state   serialized state
//! ```
//!
//! The state is written before its metadata, so a snapshot only becomes
//! visible once both are in place. Key segments are escaped to the KV
//! alphabet; any byte outside `[A-Za-z0-9_-]` becomes `=XX`.

use crate::infrastructure::snapshot_store::{SnapshotError, SnapshotStore};
use crate::order_key::OrderKey;
use crate::snapshot::{AggregateId, LocalSnapshot, SerializedSnapshot};
use crate::watermark::WatermarkMap;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

const META: &str = "meta";
const STATE: &str = "state";

/// Configuration of the JetStream snapshot bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct JetStreamSnapshotConfig {
    /// Name of the key/value bucket
    pub bucket: String,
    /// Largest serialized state accepted, in bytes
    pub max_value_size: i32,
    /// Revisions kept per key
    pub history: i64,
}

impl Default for JetStreamSnapshotConfig {
    fn default() -> Self {
        Self {
            bucket: "reconcile-snapshots".to_string(),
            max_value_size: 10 * 1024 * 1024,
            history: 1,
        }
    }
}

/// Position information stored next to the state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotMeta {
    order_key: OrderKey,
    watermarks: WatermarkMap,
    horizon: Option<OrderKey>,
    cycle: u64,
}

impl SnapshotMeta {
    fn of(snapshot: &SerializedSnapshot) -> Self {
        Self {
            order_key: snapshot.order_key.clone(),
            watermarks: snapshot.watermarks.clone(),
            horizon: snapshot.horizon.clone(),
            cycle: snapshot.cycle,
        }
    }

    fn survives_conflict(&self, low: &OrderKey, high: &OrderKey) -> bool {
        self.order_key < *low || self.horizon.as_ref().is_some_and(|horizon| horizon > high)
    }

    fn with_state(self, state: String) -> SerializedSnapshot {
        LocalSnapshot {
            state,
            watermarks: self.watermarks,
            cycle: self.cycle,
            order_key: self.order_key,
            horizon: self.horizon,
        }
    }
}

fn escape(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "={byte:02X}");
        }
    }
    if escaped.is_empty() {
        escaped.push('=');
    }
    escaped
}

fn name_prefix(aggregate: &AggregateId) -> String {
    format!("{}.{}.", escape(&aggregate.kind), escape(&aggregate.name))
}

fn version_prefix(aggregate: &AggregateId) -> String {
    format!("{}v{}.", name_prefix(aggregate), aggregate.version)
}

fn entry_key(aggregate: &AggregateId, tag: &str, part: &str) -> String {
    format!("{}{}.{part}", version_prefix(aggregate), escape(tag))
}

fn state_key_for(meta_key: &str) -> Option<String> {
    meta_key
        .strip_suffix(META)
        .filter(|base| base.ends_with('.'))
        .map(|base| format!("{base}{STATE}"))
}

fn jetstream_error(err: impl std::fmt::Display) -> SnapshotError {
    SnapshotError::JetStreamError(err.to_string())
}

/// Snapshot store backed by a JetStream key/value bucket
pub struct JetStreamSnapshotStore {
    kv: Arc<kv::Store>,
}

impl JetStreamSnapshotStore {
    /// Create the bucket if needed and open it.
    pub async fn new(
        jetstream: &jetstream::Context,
        config: &JetStreamSnapshotConfig,
    ) -> Result<Self, SnapshotError> {
        let kv = jetstream
            .create_key_value(kv::Config {
                bucket: config.bucket.clone(),
                description: "Local snapshots of derived state".to_string(),
                max_value_size: config.max_value_size,
                history: config.history,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(jetstream_error)?;

        info!(bucket = %config.bucket, "JetStream snapshot store initialized");
        Ok(Self { kv: Arc::new(kv) })
    }

    /// Open the store on a plain NATS connection.
    pub async fn connect(
        client: async_nats::Client,
        config: &JetStreamSnapshotConfig,
    ) -> Result<Self, SnapshotError> {
        let jetstream = jetstream::new(client);
        Self::new(&jetstream, config).await
    }

    async fn meta_keys(&self, prefix: &str) -> Result<Vec<String>, SnapshotError> {
        let mut keys = self.kv.keys().await.map_err(jetstream_error)?;
        let mut found = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(jetstream_error)?;
            if key.starts_with(prefix) && state_key_for(&key).is_some() {
                found.push(key);
            }
        }
        Ok(found)
    }

    async fn read_meta(&self, key: &str) -> Result<Option<SnapshotMeta>, SnapshotError> {
        let Some(entry) = self.kv.get(key).await.map_err(jetstream_error)? else {
            return Ok(None);
        };
        serde_json::from_slice(&entry)
            .map(Some)
            .map_err(|e| SnapshotError::SerializationError(e.to_string()))
    }
}

#[async_trait]
impl SnapshotStore for JetStreamSnapshotStore {
    async fn retrieve(
        &self,
        aggregate: &AggregateId,
    ) -> Result<Option<SerializedSnapshot>, SnapshotError> {
        let mut latest: Option<(String, SnapshotMeta)> = None;
        for key in self.meta_keys(&version_prefix(aggregate)).await? {
            match self.read_meta(&key).await {
                Ok(Some(meta)) => {
                    if latest.as_ref().map_or(true, |(_, best)| meta.order_key > best.order_key) {
                        latest = Some((key, meta));
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(key = %key, error = %err, "Skipping unreadable snapshot metadata"),
            }
        }

        let Some((meta_key, meta)) = latest else {
            debug!(aggregate = %aggregate, "No stored snapshot");
            return Ok(None);
        };
        let state_key = state_key_for(&meta_key)
            .ok_or_else(|| SnapshotError::StorageError(format!("malformed key {meta_key}")))?;
        let Some(state) = self.kv.get(&state_key).await.map_err(jetstream_error)? else {
            warn!(key = %state_key, "Snapshot metadata without state");
            return Ok(None);
        };
        let state = String::from_utf8(state.to_vec())
            .map_err(|e| SnapshotError::SerializationError(e.to_string()))?;

        debug!(aggregate = %aggregate, key = %meta.order_key, "Retrieved snapshot");
        Ok(Some(meta.with_state(state)))
    }

    async fn store(
        &self,
        aggregate: &AggregateId,
        tag: &str,
        snapshot: &SerializedSnapshot,
    ) -> Result<bool, SnapshotError> {
        let meta_key = entry_key(aggregate, tag, META);
        if let Some(existing) = self.read_meta(&meta_key).await? {
            if existing.order_key >= snapshot.order_key {
                return Ok(false);
            }
        }

        let meta = serde_json::to_vec(&SnapshotMeta::of(snapshot))
            .map_err(|e| SnapshotError::SerializationError(e.to_string()))?;
        self.kv
            .put(entry_key(aggregate, tag, STATE), Bytes::from(snapshot.state.clone().into_bytes()))
            .await
            .map_err(jetstream_error)?;
        self.kv
            .put(meta_key, Bytes::from(meta))
            .await
            .map_err(jetstream_error)?;

        debug!(aggregate = %aggregate, tag = %tag, key = %snapshot.order_key, "Stored snapshot");
        Ok(true)
    }

    async fn invalidate(
        &self,
        aggregate: &AggregateId,
        low: &OrderKey,
        high: &OrderKey,
    ) -> Result<(), SnapshotError> {
        for key in self.meta_keys(&name_prefix(aggregate)).await? {
            let Some(meta) = self.read_meta(&key).await? else {
                continue;
            };
            if meta.survives_conflict(low, high) {
                continue;
            }
            self.kv.delete(&key).await.map_err(jetstream_error)?;
            if let Some(state_key) = state_key_for(&key) {
                self.kv.delete(&state_key).await.map_err(jetstream_error)?;
            }
            debug!(key = %key, order_key = %meta.order_key, "Invalidated snapshot");
        }
        Ok(())
    }
}
