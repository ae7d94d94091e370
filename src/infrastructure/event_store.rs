// Copyright 2025 Cowboy AI, LLC.

//! Upstream event store interface
//!
//! The replicated store delivers events in batches. Bounded queries cover a
//! watermark window known at query time; live queries deliver whatever arrives
//! afterwards, in no particular order within a batch.

use crate::events::{Event, TagQuery};
use crate::watermark::WatermarkMap;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when querying the upstream store
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// Failed to reach the store
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The store rejected or aborted a query
    #[error("Query error: {0}")]
    QueryError(String),

    /// A live consumer fell too far behind and missed events
    #[error("Live query lagged behind by {0} batches")]
    Lagged(u64),

    /// A stream ended that should have been unbounded
    #[error("Event stream closed")]
    Closed,
}

/// Stream of event batches returned by queries
pub type EventBatchStream = BoxStream<'static, Result<Vec<Event>, EventStoreError>>;

/// Delivery order of a bounded query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOrder {
    /// Ascending by order key
    Asc,
    /// Descending by order key
    Desc,
    /// Ascending per stream, streams interleaved arbitrarily
    StreamAsc,
}

/// The replicated event store as seen by one client
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Watermarks of all events currently available locally.
    async fn present(&self) -> Result<WatermarkMap, EventStoreError>;

    /// Events matching `selector` that are not covered by `from_exclusive` but
    /// are covered by `to_inclusive`.
    async fn bounded_query(
        &self,
        selector: &TagQuery,
        from_exclusive: &WatermarkMap,
        to_inclusive: &WatermarkMap,
        order: QueryOrder,
    ) -> Result<EventBatchStream, EventStoreError>;

    /// All events matching `selector` not covered by `from_exclusive`, including
    /// those that arrive in the future. The stream does not end on its own.
    async fn live_query(
        &self,
        selector: &TagQuery,
        from_exclusive: &WatermarkMap,
    ) -> Result<EventBatchStream, EventStoreError>;
}
