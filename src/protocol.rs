// Copyright 2025 Cowboy AI, LLC.

//! Monotonic subscription protocol
//!
//! Turns the upstream store's unordered batches into a stream of messages
//! whose events only ever move forward in order-key terms. The first message
//! always describes the starting point. Catch-up batches from a bounded query
//! follow, then a synthetic empty batch marks the switch to the live query.
//!
//! Whenever a batch contains an event that sorts at or before something already
//! delivered, the protocol reports time travel and stops. It is up to the
//! consumer to pick a new starting point and start over.

use crate::events::{Event, TagQuery};
use crate::infrastructure::event_store::{EventStore, EventStoreError, QueryOrder};
use crate::infrastructure::snapshot_store::SnapshotStore;
use crate::order_key::OrderKey;
use crate::snapshot::{AggregateId, SerializedSnapshot};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Message delivered by a monotonic subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// Start from this snapshot; always the first message
    State(SerializedSnapshot),
    /// Events sorting after everything delivered so far, in order
    Events {
        /// The events, sorted by key
        events: Vec<Event>,
        /// Whether the subscription has caught up with the store's present
        caught_up: bool,
    },
    /// Events arrived that sort at or before already delivered ones
    TimeTravel {
        /// Earliest offending event
        trigger: Event,
        /// Latest offending event
        high: Event,
    },
}

/// Where a monotonic subscription starts
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePoint {
    /// Start from exactly this snapshot
    Snapshot(SerializedSnapshot),
    /// Start from the snapshot store's latest snapshot, or `fallback` if it has
    /// none
    Stored {
        /// Snapshot used when the store has nothing usable
        fallback: SerializedSnapshot,
    },
}

/// Ordering check at the heart of the protocol.
///
/// Tracks the key of the last delivered event and the horizon of the starting
/// snapshot. Events sorting before that horizon can no longer influence the
/// state and are ignored.
#[derive(Debug, Clone)]
pub struct MonotonicEndpoint {
    latest: OrderKey,
    horizon: Option<OrderKey>,
}

impl MonotonicEndpoint {
    /// Endpoint positioned at `start`.
    pub fn new(start: &SerializedSnapshot) -> Self {
        Self {
            latest: start.order_key.clone(),
            horizon: start.horizon.clone(),
        }
    }

    /// Key of the last delivered event.
    pub fn latest(&self) -> &OrderKey {
        &self.latest
    }

    /// Classify one upstream batch.
    ///
    /// Returns `None` if nothing in the batch needs delivering.
    pub fn classify(&mut self, mut batch: Vec<Event>, caught_up: bool) -> Option<ProtocolMessage> {
        batch.sort_by(|a, b| a.key.cmp(&b.key));

        let split = batch.partition_point(|event| event.key <= self.latest);
        let fresh = batch.split_off(split);
        let mut late = batch;
        if let Some(horizon) = &self.horizon {
            late.retain(|event| event.key >= *horizon);
        }

        if let (Some(trigger), Some(high)) = (late.first(), late.last()) {
            return Some(ProtocolMessage::TimeTravel {
                trigger: trigger.clone(),
                high: high.clone(),
            });
        }

        let last = fresh.last()?;
        self.latest = last.key.clone();
        Some(ProtocolMessage::Events {
            events: fresh,
            caught_up,
        })
    }
}

type MessageResult = Result<ProtocolMessage, EventStoreError>;

/// Running monotonic subscription.
///
/// Dropping it stops the background task along with its upstream queries.
pub struct MonotonicStream {
    messages: mpsc::Receiver<MessageResult>,
    task: JoinHandle<()>,
}

impl MonotonicStream {
    /// The next message, or `None` once the subscription has ended.
    ///
    /// A subscription ends after time travel or an error.
    pub async fn next_message(&mut self) -> Option<MessageResult> {
        self.messages.recv().await
    }
}

impl Drop for MonotonicStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Factory for monotonic subscriptions over one aggregate
#[derive(Clone)]
pub struct CausalProtocol {
    event_store: Arc<dyn EventStore>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    aggregate: AggregateId,
    selector: TagQuery,
    capacity: usize,
}

impl CausalProtocol {
    /// Create the protocol; `capacity` bounds the number of undelivered
    /// messages.
    pub fn new(
        event_store: Arc<dyn EventStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        aggregate: AggregateId,
        selector: TagQuery,
        capacity: usize,
    ) -> Self {
        Self {
            event_store,
            snapshot_store: Some(snapshot_store),
            aggregate,
            selector,
            capacity: capacity.max(1),
        }
    }

    /// Leave the snapshot store alone: `ResumePoint::Stored` always resolves
    /// to its fallback and time travel invalidates nothing.
    ///
    /// For subscriptions whose states do not describe the full log.
    pub fn detached(mut self) -> Self {
        self.snapshot_store = None;
        self
    }

    /// Start a subscription from `resume`.
    pub fn start(&self, resume: ResumePoint) -> MonotonicStream {
        let (sender, messages) = mpsc::channel(self.capacity);
        let protocol = self.clone();
        let task = tokio::spawn(
            async move {
                if let Err(err) = protocol.run(resume, &sender).await {
                    let _ = sender.send(Err(err)).await;
                }
            }
            .in_current_span(),
        );
        MonotonicStream { messages, task }
    }

    async fn resolve(&self, resume: ResumePoint) -> SerializedSnapshot {
        let (fallback, snapshot_store) = match (resume, &self.snapshot_store) {
            (ResumePoint::Snapshot(snapshot), _) => return snapshot,
            (ResumePoint::Stored { fallback }, None) => return fallback,
            (ResumePoint::Stored { fallback }, Some(snapshot_store)) => (fallback, snapshot_store),
        };
        match snapshot_store.retrieve(&self.aggregate).await {
            Ok(Some(stored)) => {
                debug!(aggregate = %self.aggregate, key = %stored.order_key, "Resuming from stored snapshot");
                stored
            }
            Ok(None) => fallback,
            Err(err) => {
                warn!(aggregate = %self.aggregate, error = %err, "Failed to retrieve snapshot");
                fallback
            }
        }
    }

    async fn run(&self, resume: ResumePoint, sender: &mpsc::Sender<MessageResult>) -> Result<(), EventStoreError> {
        let start = self.resolve(resume).await;
        let mut endpoint = MonotonicEndpoint::new(&start);
        let from = start.watermarks.clone();
        if sender.send(Ok(ProtocolMessage::State(start))).await.is_err() {
            return Ok(());
        }

        let present = self.event_store.present().await?.merged(&from);
        let mut catch_up = self
            .event_store
            .bounded_query(&self.selector, &from, &present, QueryOrder::Asc)
            .await?;
        while let Some(batch) = catch_up.next().await {
            if let Some(message) = endpoint.classify(batch?, false) {
                if !self.forward(message, sender).await {
                    return Ok(());
                }
            }
        }

        debug!(aggregate = %self.aggregate, latest = %endpoint.latest(), "Caught up");
        let caught_up = ProtocolMessage::Events {
            events: Vec::new(),
            caught_up: true,
        };
        if sender.send(Ok(caught_up)).await.is_err() {
            return Ok(());
        }

        let mut live = self.event_store.live_query(&self.selector, &present).await?;
        while let Some(batch) = live.next().await {
            if let Some(message) = endpoint.classify(batch?, true) {
                if !self.forward(message, sender).await {
                    return Ok(());
                }
            }
        }
        Err(EventStoreError::Closed)
    }

    // Returns whether the subscription continues.
    async fn forward(&self, message: ProtocolMessage, sender: &mpsc::Sender<MessageResult>) -> bool {
        if let ProtocolMessage::TimeTravel { trigger, high } = &message {
            info!(
                aggregate = %self.aggregate,
                trigger = %trigger.key,
                high = %high.key,
                "Time travel detected"
            );
            if let Some(snapshot_store) = &self.snapshot_store {
                if let Err(err) = snapshot_store
                    .invalidate(&self.aggregate, &trigger.key, &high.key)
                    .await
                {
                    warn!(aggregate = %self.aggregate, error = %err, "Failed to invalidate snapshots");
                }
            }
            let _ = sender.send(Ok(message)).await;
            return false;
        }
        sender.send(Ok(message)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_event_store::InMemoryEventStore;
    use crate::infrastructure::snapshot_store::InMemorySnapshotStore;
    use crate::snapshot::LocalSnapshot;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn event(lamport: u64, stream: &str, offset: u64) -> Event {
        Event::new(OrderKey::new(lamport, stream, offset), Utc::now(), json!(1))
    }

    fn keys(message: &ProtocolMessage) -> Vec<OrderKey> {
        match message {
            ProtocolMessage::Events { events, .. } => events.iter().map(|e| e.key.clone()).collect(),
            other => panic!("expected events, got {other:?}"),
        }
    }

    fn scratch() -> SerializedSnapshot {
        LocalSnapshot::initial("0".to_string())
    }

    fn snapshot_at(key: OrderKey) -> SerializedSnapshot {
        let mut snapshot = scratch();
        snapshot.watermarks.update_from(&key);
        snapshot.order_key = key;
        snapshot
    }

    #[test]
    fn test_classify_sorts_and_advances() {
        let mut endpoint = MonotonicEndpoint::new(&scratch());
        let message = endpoint
            .classify(vec![event(3, "a", 1), event(1, "a", 0), event(2, "b", 0)], true)
            .unwrap();
        assert_eq!(
            keys(&message),
            vec![OrderKey::new(1, "a", 0), OrderKey::new(2, "b", 0), OrderKey::new(3, "a", 1)]
        );
        assert_eq!(endpoint.latest(), &OrderKey::new(3, "a", 1));
        assert!(endpoint.classify(Vec::new(), true).is_none());
    }

    #[test]
    fn test_classify_reports_late_events() {
        let mut endpoint = MonotonicEndpoint::new(&snapshot_at(OrderKey::new(5, "a", 3)));
        let message = endpoint
            .classify(vec![event(6, "a", 4), event(4, "b", 1), event(2, "b", 0)], true)
            .unwrap();
        match message {
            ProtocolMessage::TimeTravel { trigger, high } => {
                assert_eq!(trigger.key, OrderKey::new(2, "b", 0));
                assert_eq!(high.key, OrderKey::new(4, "b", 1));
            }
            other => panic!("expected time travel, got {other:?}"),
        }
        assert_eq!(endpoint.latest(), &OrderKey::new(5, "a", 3));
    }

    #[test]
    fn test_classify_ignores_events_behind_horizon() {
        let mut start = snapshot_at(OrderKey::new(9, "a", 3));
        start.horizon = Some(OrderKey::new(5, "a", 1));
        let mut endpoint = MonotonicEndpoint::new(&start);

        let message = endpoint
            .classify(vec![event(2, "b", 0), event(10, "a", 4)], false)
            .unwrap();
        assert_eq!(keys(&message), vec![OrderKey::new(10, "a", 4)]);

        assert!(endpoint.classify(vec![event(3, "b", 1)], false).is_none());
        assert!(matches!(
            endpoint.classify(vec![event(7, "b", 2)], false),
            Some(ProtocolMessage::TimeTravel { .. })
        ));
    }

    fn protocol(events: &InMemoryEventStore, snapshots: &Arc<InMemorySnapshotStore>) -> CausalProtocol {
        CausalProtocol::new(
            Arc::new(events.clone()),
            snapshots.clone(),
            AggregateId::new("sum", "total", 1),
            TagQuery::All,
            16,
        )
    }

    async fn next(stream: &mut MonotonicStream) -> Option<MessageResult> {
        tokio::time::timeout(Duration::from_secs(2), stream.next_message())
            .await
            .expect("protocol message")
    }

    #[tokio::test]
    async fn test_empty_store_catches_up_then_goes_live() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let mut stream = protocol(&events, &snapshots).start(ResumePoint::Snapshot(scratch()));

        assert_eq!(next(&mut stream).await.unwrap().unwrap(), ProtocolMessage::State(scratch()));
        assert_eq!(
            next(&mut stream).await.unwrap().unwrap(),
            ProtocolMessage::Events {
                events: Vec::new(),
                caught_up: true
            }
        );

        events.append(vec![event(1, "a", 0)]).await;
        let live = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(keys(&live), vec![OrderKey::new(1, "a", 0)]);
        assert!(matches!(live, ProtocolMessage::Events { caught_up: true, .. }));
    }

    #[tokio::test]
    async fn test_live_time_travel_invalidates_and_ends() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let aggregate = AggregateId::new("sum", "total", 1);
        snapshots
            .store(&aggregate, "10", &snapshot_at(OrderKey::new(3, "a", 1)))
            .await
            .unwrap();

        events.append(vec![event(1, "a", 0)]).await;
        let mut stream = protocol(&events, &snapshots).start(ResumePoint::Snapshot(scratch()));
        assert!(matches!(next(&mut stream).await, Some(Ok(ProtocolMessage::State(_)))));
        assert_eq!(keys(&next(&mut stream).await.unwrap().unwrap()), vec![OrderKey::new(1, "a", 0)]);
        assert!(keys(&next(&mut stream).await.unwrap().unwrap()).is_empty());

        events.append(vec![event(3, "a", 1)]).await;
        assert_eq!(keys(&next(&mut stream).await.unwrap().unwrap()), vec![OrderKey::new(3, "a", 1)]);

        events.append(vec![event(2, "b", 0)]).await;
        match next(&mut stream).await.unwrap().unwrap() {
            ProtocolMessage::TimeTravel { trigger, high } => {
                assert_eq!(trigger.key, OrderKey::new(2, "b", 0));
                assert_eq!(high.key, OrderKey::new(2, "b", 0));
            }
            other => panic!("expected time travel, got {other:?}"),
        }
        assert!(next(&mut stream).await.is_none());
        assert!(snapshots.retrieve(&aggregate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_from_stored_snapshot() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let aggregate = AggregateId::new("sum", "total", 1);
        events
            .append(vec![event(1, "a", 0), event(2, "a", 1), event(3, "a", 2)])
            .await;
        let stored = snapshot_at(OrderKey::new(2, "a", 1));
        snapshots.store(&aggregate, "10", &stored).await.unwrap();

        let mut stream = protocol(&events, &snapshots).start(ResumePoint::Stored { fallback: scratch() });
        assert_eq!(next(&mut stream).await.unwrap().unwrap(), ProtocolMessage::State(stored));
        let catch_up = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(keys(&catch_up), vec![OrderKey::new(3, "a", 2)]);
        assert!(matches!(catch_up, ProtocolMessage::Events { caught_up: false, .. }));
    }

    #[tokio::test]
    async fn test_stale_resume_point_detected_during_catch_up() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        events
            .append(vec![event(1, "a", 0), event(3, "b", 0), event(5, "a", 1)])
            .await;

        // claims to be at lamport 5 but never saw stream b
        let mut start = snapshot_at(OrderKey::new(5, "a", 1));
        start.watermarks.update_from(&OrderKey::new(1, "a", 0));
        let mut stream = protocol(&events, &snapshots).start(ResumePoint::Snapshot(start));

        assert!(matches!(next(&mut stream).await, Some(Ok(ProtocolMessage::State(_)))));
        match next(&mut stream).await.unwrap().unwrap() {
            ProtocolMessage::TimeTravel { trigger, .. } => assert_eq!(trigger.key, OrderKey::new(3, "b", 0)),
            other => panic!("expected time travel, got {other:?}"),
        }
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        events.set_fail_queries(true).await;

        let mut stream = protocol(&events, &snapshots).start(ResumePoint::Snapshot(scratch()));
        assert!(matches!(next(&mut stream).await, Some(Ok(ProtocolMessage::State(_)))));
        assert!(matches!(
            next(&mut stream).await,
            Some(Err(EventStoreError::ConnectionError(_)))
        ));
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_time_travel_behind_reset_keeps_stored_snapshot() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let aggregate = AggregateId::new("sum", "total", 1);
        let mut after_reset = snapshot_at(OrderKey::new(9, "a", 3));
        after_reset.horizon = Some(OrderKey::new(7, "a", 2));
        snapshots.store(&aggregate, "10", &after_reset).await.unwrap();

        events.append(vec![event(1, "a", 0), event(4, "a", 1)]).await;
        let mut stream = protocol(&events, &snapshots).start(ResumePoint::Snapshot(scratch()));
        assert!(matches!(next(&mut stream).await, Some(Ok(ProtocolMessage::State(_)))));
        assert_eq!(keys(&next(&mut stream).await.unwrap().unwrap()).len(), 2);
        assert!(keys(&next(&mut stream).await.unwrap().unwrap()).is_empty());

        events.append(vec![event(2, "b", 0), event(3, "b", 1)]).await;
        assert!(matches!(
            next(&mut stream).await,
            Some(Ok(ProtocolMessage::TimeTravel { .. }))
        ));
        assert!(next(&mut stream).await.is_none());
        assert_eq!(snapshots.retrieve(&aggregate).await.unwrap(), Some(after_reset));
    }

    #[tokio::test]
    async fn test_detached_protocol_ignores_snapshot_store() {
        let events = InMemoryEventStore::new();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let aggregate = AggregateId::new("sum", "total", 1);
        let stored = snapshot_at(OrderKey::new(3, "a", 1));
        snapshots.store(&aggregate, "10", &stored).await.unwrap();
        events.append(vec![event(1, "a", 0), event(3, "a", 1)]).await;

        let mut stream = protocol(&events, &snapshots)
            .detached()
            .start(ResumePoint::Stored { fallback: scratch() });
        assert_eq!(next(&mut stream).await.unwrap().unwrap(), ProtocolMessage::State(scratch()));
        assert_eq!(keys(&next(&mut stream).await.unwrap().unwrap()).len(), 2);
        assert!(keys(&next(&mut stream).await.unwrap().unwrap()).is_empty());

        events.append(vec![event(2, "b", 0)]).await;
        assert!(matches!(
            next(&mut stream).await,
            Some(Ok(ProtocolMessage::TimeTravel { .. }))
        ));
        assert_eq!(snapshots.retrieve(&aggregate).await.unwrap(), Some(stored));
    }
}
