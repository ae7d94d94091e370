// Copyright 2025 Cowboy AI, LLC.

//! Per-stream progress tracking.
//!
//! A [`WatermarkMap`] records, for every stream seen so far, the highest offset
//! that has been incorporated. Queries against the upstream store are expressed
//! as watermark windows (`from` exclusive, `to` inclusive).

use crate::order_key::{Offset, OrderKey, StreamId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from stream to the highest known offset in that stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WatermarkMap(BTreeMap<StreamId, Offset>);

impl WatermarkMap {
    /// An empty map: nothing has been seen from any stream.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True if no stream has a watermark.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of streams tracked.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Highest known offset of a stream, if any.
    pub fn offset(&self, stream: &StreamId) -> Option<Offset> {
        self.0.get(stream).copied()
    }

    /// Raise the watermark of `stream` to `offset`; a lower offset is ignored.
    ///
    /// Returns the previous watermark.
    pub fn update(&mut self, stream: StreamId, offset: Offset) -> Option<Offset> {
        let previous = self.0.get(&stream).copied();
        if previous.map_or(true, |p| p < offset) {
            self.0.insert(stream, offset);
        }
        previous
    }

    /// Raise the watermark for the stream of an event key.
    pub fn update_from(&mut self, key: &OrderKey) -> Option<Offset> {
        self.update(key.stream.clone(), key.offset)
    }

    /// Merge `other` into `self`, keeping the maximum per stream.
    pub fn merge_max(&mut self, other: &WatermarkMap) {
        for (stream, offset) in &other.0 {
            self.update(stream.clone(), *offset);
        }
    }

    /// A new map holding the per-stream maximum of both maps.
    pub fn merged(&self, other: &WatermarkMap) -> WatermarkMap {
        let mut result = self.clone();
        result.merge_max(other);
        result
    }

    /// Whether the event identified by `key` is covered by this map.
    pub fn contains(&self, key: &OrderKey) -> bool {
        self.offset(&key.stream)
            .map_or(false, |watermark| key.offset <= watermark)
    }

    /// Iterate over `(stream, offset)` pairs in stream order.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &Offset)> {
        self.0.iter()
    }
}

impl FromIterator<(StreamId, Offset)> for WatermarkMap {
    fn from_iter<T: IntoIterator<Item = (StreamId, Offset)>>(iter: T) -> Self {
        let mut map = WatermarkMap::empty();
        for (stream, offset) in iter {
            map.update(stream, offset);
        }
        map
    }
}
