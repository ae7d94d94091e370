// Copyright 2025 Cowboy AI, LLC.

//! In-memory upstream event store
//!
//! Keeps every appended event in memory and fans new appends out to live
//! queries. Appended batches are delivered to live consumers exactly as they
//! were appended, so callers can reproduce out-of-order arrival by appending
//! events in any order.

use crate::events::{Event, TagQuery};
use crate::infrastructure::event_store::{EventBatchStream, EventStore, EventStoreError, QueryOrder};
use crate::watermark::WatermarkMap;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::debug;

const LIVE_CAPACITY: usize = 1024;

type LiveBatch = Result<Vec<Event>, EventStoreError>;

/// Upstream store holding all events in memory
#[derive(Clone)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<Event>>>,
    live: broadcast::Sender<LiveBatch>,
    batch_size: usize,
    fail_queries: Arc<RwLock<bool>>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Create an empty store delivering bounded results in batches of 256.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            live,
            batch_size: 256,
            fail_queries: Arc::new(RwLock::new(false)),
        }
    }

    /// Deliver bounded query results in batches of `batch_size` events.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Make every subsequent query fail until reset.
    pub async fn set_fail_queries(&self, fail: bool) {
        *self.fail_queries.write().await = fail;
    }

    /// Add events, as if they had just been replicated from peers.
    pub async fn append(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let mut events = self.events.write().await;
        events.extend(batch.iter().cloned());
        debug!(count = batch.len(), total = events.len(), "Appended events");
        // sent while holding the lock so live queries see each batch exactly once
        let _ = self.live.send(Ok(batch));
    }

    /// Abort all running live queries with a connection error.
    pub async fn interrupt_live_queries(&self) {
        let _events = self.events.write().await;
        let _ = self
            .live
            .send(Err(EventStoreError::ConnectionError("live query interrupted".to_string())));
    }

    /// Number of events held.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Whether the store holds no events.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    async fn check_available(&self) -> Result<(), EventStoreError> {
        if *self.fail_queries.read().await {
            return Err(EventStoreError::ConnectionError(
                "store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn selected(selector: &TagQuery, from_exclusive: &WatermarkMap, event: &Event) -> bool {
    !from_exclusive.contains(&event.key) && selector.matches(event)
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn present(&self) -> Result<WatermarkMap, EventStoreError> {
        self.check_available().await?;
        let events = self.events.read().await;
        let mut present = WatermarkMap::empty();
        for event in events.iter() {
            present.update_from(&event.key);
        }
        Ok(present)
    }

    async fn bounded_query(
        &self,
        selector: &TagQuery,
        from_exclusive: &WatermarkMap,
        to_inclusive: &WatermarkMap,
        order: QueryOrder,
    ) -> Result<EventBatchStream, EventStoreError> {
        self.check_available().await?;
        let mut found: Vec<Event> = {
            let events = self.events.read().await;
            events
                .iter()
                .filter(|e| to_inclusive.contains(&e.key) && selected(selector, from_exclusive, e))
                .cloned()
                .collect()
        };
        match order {
            QueryOrder::Asc => found.sort_by(|a, b| a.key.cmp(&b.key)),
            QueryOrder::Desc => found.sort_by(|a, b| b.key.cmp(&a.key)),
            QueryOrder::StreamAsc => found.sort_by(|a, b| {
                (&a.key.stream, a.key.offset).cmp(&(&b.key.stream, b.key.offset))
            }),
        }

        let batches: Vec<_> = found
            .chunks(self.batch_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(batches).boxed())
    }

    async fn live_query(
        &self,
        selector: &TagQuery,
        from_exclusive: &WatermarkMap,
    ) -> Result<EventBatchStream, EventStoreError> {
        self.check_available().await?;
        let (known, receiver) = {
            let events = self.events.read().await;
            let receiver = self.live.subscribe();
            let known: Vec<Event> = events
                .iter()
                .filter(|e| selected(selector, from_exclusive, e))
                .cloned()
                .collect();
            (known, receiver)
        };

        let initial = if known.is_empty() {
            Vec::new()
        } else {
            vec![Ok(known)]
        };

        let selector = selector.clone();
        let from_exclusive = from_exclusive.clone();
        let live = stream::unfold(receiver, move |mut receiver| {
            let selector = selector.clone();
            let from_exclusive = from_exclusive.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(Ok(batch)) => {
                            let batch: Vec<Event> = batch
                                .into_iter()
                                .filter(|e| selected(&selector, &from_exclusive, e))
                                .collect();
                            if !batch.is_empty() {
                                return Some((Ok(batch), receiver));
                            }
                        }
                        Ok(Err(err)) => return Some((Err(err), receiver)),
                        Err(RecvError::Lagged(missed)) => {
                            return Some((Err(EventStoreError::Lagged(missed)), receiver))
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(initial).chain(live).boxed())
    }
}
