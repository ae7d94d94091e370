// Copyright 2025 Cowboy AI, LLC.

//! # CIM Reconcile
//!
//! Client-side reconciliation of derived state over a replicated, partially
//! ordered event log.
//!
//! Peers replicate events asynchronously, so a client may learn of an event
//! only after it has already computed state past the point where that event
//! sorts. This crate keeps an aggregate's state correct regardless:
//! - **Protocol**: turns unordered batches into a monotonic message stream
//!   and detects time travel
//! - **Scheduler**: picks the positions worth caching, purely from an event's
//!   position since the last reset
//! - **Cache**: folds events incrementally and keeps pending snapshots as
//!   rollback points, persisting them in the background once they have aged
//! - **Orchestrator**: composes the above into a cancellable subscription that
//!   heals itself after store failures
//!
//! ```no_run
//! use cim_reconcile::{
//!     AggregateId, FnReducer, InMemoryEventStore, InMemorySnapshotStore, Reconciler,
//!     SubscriptionConfig, TagQuery,
//! };
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let reconciler = Reconciler::new(
//!     Arc::new(InMemoryEventStore::new()),
//!     Arc::new(InMemorySnapshotStore::new()),
//!     SubscriptionConfig::default(),
//! );
//! let total = FnReducer::new(0i64, |sum: i64, event: &cim_reconcile::Event| {
//!     Ok::<_, anyhow::Error>(sum + event.payload.as_i64().unwrap_or(0))
//! });
//! let mut states = reconciler.subscribe(
//!     AggregateId::new("total", "all", 1),
//!     TagQuery::all_of(["amount"]),
//!     total,
//!     None,
//! );
//! while let Some(Ok(snapshot)) = states.next().await {
//!     println!("{} after {}", snapshot.state, snapshot.order_key);
//! }
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod errors;
pub mod events;
pub mod infrastructure;
pub mod orchestrator;
pub mod order_key;
pub mod protocol;
pub mod reducer;
pub mod scheduler;
pub mod snapshot;
pub mod watermark;

pub use cache::{PendingSnapshot, SnapshotCache};
pub use errors::{ReconcileError, ReconcileResult};
pub use events::{Event, TagQuery, Tags};
pub use infrastructure::{
    EventStore, EventStoreError, InMemoryEventStore, InMemorySnapshotStore, JetStreamSnapshotConfig,
    JetStreamSnapshotStore, QueryOrder, SnapshotError, SnapshotStore,
};
pub use orchestrator::{CancelHandle, Reconciler, Subscription, SubscriptionConfig};
pub use order_key::{LamportTime, Offset, OrderKey, StreamId};
pub use protocol::{CausalProtocol, MonotonicEndpoint, MonotonicStream, ProtocolMessage, ResumePoint};
pub use reducer::{FnReducer, IncrementalReducer, Reducer};
pub use scheduler::{LevelScheduler, NeverScheduler, SnapshotCandidate, SnapshotConfig, SnapshotScheduler};
pub use snapshot::{AggregateId, FixedStart, JsonCodec, LocalSnapshot, SerializedSnapshot, StateCodec};
pub use watermark::WatermarkMap;
