// Copyright 2025 Cowboy AI, LLC.

//! Self-healing subscriptions to derived state
//!
//! A [`Reconciler`] hands out [`Subscription`]s. Each subscription runs one
//! background task that drives the monotonic protocol, feeds its batches into a
//! [`SnapshotCache`] and emits the resulting head after every batch.
//!
//! Time travel rolls the cache back to the latest pending snapshot that the
//! conflict cannot have affected and restarts the protocol from there. Store
//! failures restart the protocol from scratch after a backoff; they never end
//! the subscription. Only a failing fold does, since retrying cannot fix
//! business logic.

use crate::cache::SnapshotCache;
use crate::errors::ReconcileResult;
use crate::events::TagQuery;
use crate::infrastructure::event_store::EventStore;
use crate::infrastructure::snapshot_store::SnapshotStore;
use crate::order_key::OrderKey;
use crate::protocol::{CausalProtocol, MonotonicStream, ProtocolMessage, ResumePoint};
use crate::reducer::Reducer;
use crate::scheduler::SnapshotConfig;
use crate::snapshot::{AggregateId, FixedStart, JsonCodec, LocalSnapshot, SerializedSnapshot, StateCodec};
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Configuration of subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Local snapshot caching
    pub snapshots: SnapshotConfig,
    /// Protocol messages buffered between the protocol task and the fold loop
    pub message_capacity: usize,
    /// States buffered for the subscriber
    pub emission_capacity: usize,
    /// Delay before the first restart after a store failure
    pub restart_backoff_ms: u64,
    /// Upper bound of the restart delay
    pub max_restart_backoff_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            snapshots: SnapshotConfig::default(),
            message_capacity: 64,
            emission_capacity: 16,
            restart_backoff_ms: 100,
            max_restart_backoff_ms: 30_000,
        }
    }
}

/// Entry point for subscribing to derived state
#[derive(Clone)]
pub struct Reconciler {
    event_store: Arc<dyn EventStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    config: SubscriptionConfig,
}

impl Reconciler {
    /// Create a reconciler over the given stores.
    pub fn new(
        event_store: Arc<dyn EventStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            event_store,
            snapshot_store,
            config,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Subscribe to the state of `aggregate`, serialized as JSON in caches.
    ///
    /// `resume_hint` states that every event up to it has already been
    /// accounted for by the caller; the subscription then starts from the
    /// reducer's initial state at that point. Its states leave out the events
    /// before the hint, so such a subscription neither reads nor writes the
    /// snapshot store.
    pub fn subscribe<R>(
        &self,
        aggregate: AggregateId,
        selector: TagQuery,
        reducer: R,
        resume_hint: Option<FixedStart>,
    ) -> Subscription<R::State>
    where
        R: Reducer,
        R::State: Serialize + DeserializeOwned,
    {
        self.subscribe_with_codec(aggregate, selector, reducer, Arc::new(JsonCodec::new()), resume_hint)
    }

    /// Subscribe using a custom state codec.
    pub fn subscribe_with_codec<R: Reducer>(
        &self,
        aggregate: AggregateId,
        selector: TagQuery,
        reducer: R,
        codec: Arc<dyn StateCodec<R::State>>,
        resume_hint: Option<FixedStart>,
    ) -> Subscription<R::State> {
        let id = Uuid::new_v4();
        let (emitter, emissions) = mpsc::channel(self.config.emission_capacity.max(1));
        let (cancel, cancelled) = watch::channel(false);

        let mut cache = SnapshotCache::new(Arc::new(reducer), self.config.snapshots.scheduler(), codec);
        let mut protocol = CausalProtocol::new(
            self.event_store.clone(),
            self.snapshot_store.clone(),
            aggregate.clone(),
            selector,
            self.config.message_capacity,
        );
        if resume_hint.is_some() {
            protocol = protocol.detached();
        } else {
            cache = cache.with_persistence(aggregate.clone(), self.snapshot_store.clone());
        }
        let driver = Driver {
            protocol,
            cache,
            emitter,
            backoff: Backoff::new(&self.config),
            unpicked_rollbacks: 0,
        };

        let span = info_span!("subscription", subscription_id = %id, aggregate = %aggregate);
        tokio::spawn(driver.run(resume_hint, cancelled).instrument(span));

        Subscription {
            id,
            emissions: ReceiverStream::new(emissions),
            cancel: CancelHandle(Arc::new(cancel)),
        }
    }
}

/// Stops a subscription when invoked
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Stop the subscription. Idempotent.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Stream of derived states of one aggregate.
///
/// Yields the head after every processed batch. The stream only ends after
/// cancellation or a fold failure, which is delivered as its last item.
/// Dropping the subscription cancels it.
pub struct Subscription<S> {
    id: Uuid,
    emissions: ReceiverStream<ReconcileResult<LocalSnapshot<S>>>,
    cancel: CancelHandle,
}

impl<S> Subscription<S> {
    /// Identifier used in log output.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the subscription.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can stop the subscription from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl<S> Stream for Subscription<S> {
    type Item = ReconcileResult<LocalSnapshot<S>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.emissions.poll_next_unpin(cx)
    }
}

impl<S> Drop for Subscription<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &SubscriptionConfig) -> Self {
        let initial = Duration::from_millis(config.restart_backoff_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_restart_backoff_ms.max(config.restart_backoff_ms)),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum Restart {
    From(ResumePoint),
    Stored,
    Scratch,
    ScratchAfterBackoff,
}

enum Outcome {
    TimeTravel { trigger: OrderKey, high: OrderKey },
    Failed,
    Undecodable,
    Finished,
}

struct Driver<R: Reducer> {
    protocol: CausalProtocol,
    cache: SnapshotCache<R>,
    emitter: mpsc::Sender<ReconcileResult<LocalSnapshot<R::State>>>,
    backoff: Backoff,
    // time travels without a cache pick since the last caught-up batch
    unpicked_rollbacks: u32,
}

async fn cancellation(cancelled: &mut watch::Receiver<bool>) {
    while !*cancelled.borrow_and_update() {
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}

impl<R: Reducer> Driver<R> {
    async fn run(mut self, resume_hint: Option<FixedStart>, mut cancelled: watch::Receiver<bool>) {
        info!("Subscription started");
        let Some(mut resume) = self.first_resume_point(resume_hint).await else {
            return;
        };

        loop {
            let mut stream = self.protocol.start(resume);
            let outcome = tokio::select! {
                biased;
                _ = cancellation(&mut cancelled) => Outcome::Finished,
                outcome = self.drive(&mut stream) => outcome,
            };
            drop(stream);

            let restart = match outcome {
                Outcome::Finished => break,
                Outcome::TimeTravel { trigger, high } => self.rollback(&trigger, &high),
                Outcome::Undecodable => Restart::Scratch,
                Outcome::Failed => Restart::ScratchAfterBackoff,
            };
            let next = match restart {
                Restart::From(point) => Some(point),
                Restart::Scratch => self.scratch().await.map(ResumePoint::Snapshot),
                Restart::ScratchAfterBackoff => {
                    let delay = self.backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "Restarting from scratch");
                    tokio::select! {
                        biased;
                        _ = cancellation(&mut cancelled) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.scratch().await.map(ResumePoint::Snapshot)
                }
                Restart::Stored => self
                    .scratch()
                    .await
                    .map(|fallback| ResumePoint::Stored { fallback }),
            };
            match next {
                Some(next) => resume = next,
                None => break,
            }
        }
        info!("Subscription ended");
    }

    async fn first_resume_point(&mut self, resume_hint: Option<FixedStart>) -> Option<ResumePoint> {
        let fallback = self.scratch().await?;
        let Some(hint) = resume_hint else {
            return Some(ResumePoint::Stored { fallback });
        };
        let start = hint.snapshot(self.cache.initial_snapshot().state);
        match self.cache.codec().encode_snapshot(&start) {
            Ok(snapshot) => Some(ResumePoint::Snapshot(snapshot)),
            Err(err) => {
                warn!(error = %err, "Cannot encode resume hint, starting from scratch");
                Some(ResumePoint::Snapshot(fallback))
            }
        }
    }

    async fn scratch(&mut self) -> Option<SerializedSnapshot> {
        match self.cache.codec().encode_snapshot(&self.cache.initial_snapshot()) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                error!(error = %err, "Cannot encode initial state");
                let _ = self.emitter.send(Err(err)).await;
                None
            }
        }
    }

    fn rollback(&mut self, trigger: &OrderKey, high: &OrderKey) -> Restart {
        if let Some(pick) = self.cache.latest_known_valid_state(trigger, high) {
            info!(key = %pick.order_key, trigger = %trigger, "Rolling back to cached snapshot");
            return Restart::From(ResumePoint::Snapshot(pick));
        }
        self.unpicked_rollbacks += 1;
        if self.unpicked_rollbacks > 1 {
            // the store handed out a stale snapshot again
            warn!(trigger = %trigger, "Snapshot store keeps stale snapshots, restarting from scratch");
            return Restart::ScratchAfterBackoff;
        }
        // stored snapshots hit by the conflict are already invalidated
        debug!(trigger = %trigger, "No cached snapshot before the conflict");
        Restart::Stored
    }

    async fn drive(&mut self, stream: &mut MonotonicStream) -> Outcome {
        while let Some(message) = stream.next_message().await {
            match message {
                Ok(ProtocolMessage::State(snapshot)) => {
                    let key = snapshot.order_key.clone();
                    match self.cache.codec().decode_snapshot(snapshot) {
                        Ok(decoded) => {
                            debug!(key = %key, "Starting from snapshot");
                            self.cache.set_state(decoded);
                        }
                        Err(err) => {
                            warn!(key = %key, error = %err, "Cannot decode snapshot, starting from scratch");
                            return Outcome::Undecodable;
                        }
                    }
                }
                Ok(ProtocolMessage::Events { events, caught_up }) => {
                    let head = match self.cache.append_events(&events) {
                        Ok(head) => head,
                        Err(err) => {
                            error!(error = %err, "Fold failed, ending subscription");
                            let _ = self.emitter.send(Err(err)).await;
                            return Outcome::Finished;
                        }
                    };
                    debug!(count = events.len(), key = %head.order_key, caught_up, "Applied events");
                    if caught_up {
                        self.backoff.reset();
                        self.unpicked_rollbacks = 0;
                    }
                    if self.emitter.send(Ok(head)).await.is_err() {
                        return Outcome::Finished;
                    }
                }
                Ok(ProtocolMessage::TimeTravel { trigger, high }) => {
                    return Outcome::TimeTravel {
                        trigger: trigger.key,
                        high: high.key,
                    };
                }
                Err(err) => {
                    warn!(error = %err, "Event store failed");
                    return Outcome::Failed;
                }
            }
        }
        warn!("Monotonic subscription ended unexpectedly");
        Outcome::Failed
    }
}
