// Copyright 2025 Cowboy AI, LLC.

//! Snapshot cache
//!
//! Wraps an [`IncrementalReducer`] and keeps a queue of pending snapshots taken
//! at the positions the scheduler picks. Pending snapshots serve as rollback
//! points after time travel and are handed to the snapshot store once they have
//! aged past the scheduler's storage delay.
//!
//! Persistence runs in background tasks chained one after another, so at most
//! one flush per aggregate is writing at any time and state computation never
//! waits for storage.

use crate::errors::ReconcileResult;
use crate::events::Event;
use crate::infrastructure::snapshot_store::SnapshotStore;
use crate::order_key::OrderKey;
use crate::reducer::{IncrementalReducer, Reducer};
use crate::scheduler::SnapshotScheduler;
use crate::snapshot::{AggregateId, LocalSnapshot, SerializedSnapshot, StateCodec};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// A cached snapshot that has not been written to durable storage yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSnapshot {
    /// The snapshot with serialized state
    pub snapshot: SerializedSnapshot,
    /// Persistence slot
    pub tag: String,
    /// Timestamp of the event the snapshot was taken after
    pub timestamp: DateTime<Utc>,
    /// Whether the snapshot may be stored durably
    pub durable: bool,
}

struct Persistence {
    aggregate: AggregateId,
    store: Arc<dyn SnapshotStore>,
    in_flight: Option<JoinHandle<()>>,
}

impl Persistence {
    fn flush(&mut self, batch: Vec<PendingSnapshot>) {
        if batch.is_empty() {
            return;
        }
        let previous = self.in_flight.take();
        let store = self.store.clone();
        let aggregate = self.aggregate.clone();

        let task = async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            for pending in batch {
                let key = &pending.snapshot.order_key;
                match store.store(&aggregate, &pending.tag, &pending.snapshot).await {
                    Ok(true) => debug!(aggregate = %aggregate, tag = %pending.tag, key = %key, "Stored snapshot"),
                    Ok(false) => debug!(
                        aggregate = %aggregate,
                        tag = %pending.tag,
                        key = %key,
                        "Snapshot slot already holds a newer snapshot"
                    ),
                    Err(err) => warn!(
                        aggregate = %aggregate,
                        tag = %pending.tag,
                        key = %key,
                        error = %err,
                        "Failed to store snapshot"
                    ),
                }
            }
        };
        self.in_flight = Some(tokio::spawn(task.in_current_span()));
    }

    async fn wait(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(err) = handle.await {
                warn!(aggregate = %self.aggregate, error = %err, "Snapshot flush task failed");
            }
        }
    }
}

/// Incremental reducer with a pending-snapshot queue
pub struct SnapshotCache<R: Reducer> {
    reducer: IncrementalReducer<R>,
    scheduler: Arc<dyn SnapshotScheduler>,
    codec: Arc<dyn StateCodec<R::State>>,
    pending: VecDeque<PendingSnapshot>,
    persistence: Option<Persistence>,
}

impl<R: Reducer> SnapshotCache<R> {
    /// Create a cache that keeps snapshots in memory only.
    pub fn new(
        reducer: Arc<R>,
        scheduler: Arc<dyn SnapshotScheduler>,
        codec: Arc<dyn StateCodec<R::State>>,
    ) -> Self {
        Self {
            reducer: IncrementalReducer::new(reducer),
            scheduler,
            codec,
            pending: VecDeque::new(),
            persistence: None,
        }
    }

    /// Write eligible snapshots of `aggregate` to `store`.
    pub fn with_persistence(mut self, aggregate: AggregateId, store: Arc<dyn SnapshotStore>) -> Self {
        self.persistence = Some(Persistence {
            aggregate,
            store,
            in_flight: None,
        });
        self
    }

    /// The current head.
    pub fn head(&self) -> &LocalSnapshot<R::State> {
        self.reducer.head()
    }

    /// Head of a subscription starting from scratch.
    pub fn initial_snapshot(&self) -> LocalSnapshot<R::State> {
        self.reducer.initial_snapshot()
    }

    /// Codec used for the cached state.
    pub fn codec(&self) -> &dyn StateCodec<R::State> {
        self.codec.as_ref()
    }

    /// Pending snapshots, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingSnapshot> {
        self.pending.iter()
    }

    /// Number of pending snapshots.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Fold a sorted batch of events into the head.
    ///
    /// Snapshots are queued at the scheduled positions along the way. If the
    /// fold fails, neither the head nor the queue change.
    pub fn append_events(&mut self, events: &[Event]) -> ReconcileResult<LocalSnapshot<R::State>> {
        let Some(last) = events.last() else {
            return Ok(self.reducer.head().clone());
        };

        let head_before = self.reducer.head().clone();
        let pending_before = self.pending.len();
        if let Err(err) = self.append_runs(events) {
            self.reducer.set_state(head_before);
            self.pending.truncate(pending_before);
            return Err(err);
        }

        self.release_eligible(last.timestamp);
        Ok(self.reducer.head().clone())
    }

    // Positions restart at every reset event, so each run from one reset to the
    // next is scheduled separately.
    fn append_runs(&mut self, events: &[Event]) -> ReconcileResult<()> {
        let mut start = 0;
        while start < events.len() {
            let end = (start + 1..events.len())
                .find(|&index| self.reducer.is_reset(&events[index]))
                .unwrap_or(events.len());
            self.append_run(&events[start..end])?;
            start = end;
        }
        Ok(())
    }

    fn append_run(&mut self, run: &[Event]) -> ReconcileResult<()> {
        // a reset event sits at position 0 of the cycle it starts
        let cycle = if self.reducer.is_reset(&run[0]) {
            0
        } else {
            self.reducer.head().cycle + 1
        };
        let last_position = cycle.saturating_add(run.len() as u64 - 1);

        let mut next = 0;
        if last_position >= self.scheduler.min_events_for_snapshot() {
            for candidate in self.scheduler.candidates(cycle, run, None) {
                let head = self.reducer.apply_range(run, next, candidate.index)?;
                let snapshot = self.codec.encode_snapshot(head)?;
                debug!(tag = %candidate.tag, key = %snapshot.order_key, "Queued pending snapshot");
                self.pending.push_back(PendingSnapshot {
                    snapshot,
                    tag: candidate.tag,
                    timestamp: run[candidate.index].timestamp,
                    durable: candidate.persist_as_local_snapshot,
                });
                next = candidate.index + 1;
            }
        }
        self.reducer.apply_range(run, next, run.len() - 1)?;
        Ok(())
    }

    fn release_eligible(&mut self, latest: DateTime<Utc>) {
        if self.pending.is_empty() {
            return;
        }
        let scheduler = &self.scheduler;
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = self
            .pending
            .drain(..)
            .partition(|pending| scheduler.is_eligible_for_storage(pending, latest));
        self.pending = waiting;

        // local-only snapshots leave the queue without being written
        let durable: Vec<_> = ready.into_iter().filter(|pending| pending.durable).collect();
        if durable.is_empty() {
            return;
        }
        match self.persistence.as_mut() {
            Some(persistence) => persistence.flush(durable),
            None => debug!(count = durable.len(), "No snapshot store, dropping eligible snapshots"),
        }
    }

    /// Replace the head.
    ///
    /// Moving forward discards all pending snapshots; moving back keeps those at
    /// or before the new head.
    pub fn set_state(&mut self, snapshot: LocalSnapshot<R::State>) {
        if snapshot.order_key > self.reducer.head().order_key {
            self.pending.clear();
        } else {
            let key = snapshot.order_key.clone();
            self.pending.retain(|pending| pending.snapshot.order_key <= key);
        }
        self.reducer.set_state(snapshot);
    }

    /// The most recent pending snapshot unaffected by a conflict spanning
    /// `low..=high`.
    ///
    /// See [`LocalSnapshot::survives_conflict`].
    pub fn latest_known_valid_state(
        &self,
        low: &OrderKey,
        high: &OrderKey,
    ) -> Option<SerializedSnapshot> {
        self.pending
            .iter()
            .rev()
            .find(|pending| pending.snapshot.survives_conflict(low, high))
            .map(|pending| pending.snapshot.clone())
    }

    /// Wait until all snapshots handed to the store so far have been written.
    pub async fn wait_for_persistence(&mut self) {
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.wait().await;
        }
    }
}
