// Copyright 2025 Cowboy AI, LLC.

//! Incremental reduction of ordered events into aggregate state.

use crate::errors::{ReconcileError, ReconcileResult};
use crate::events::Event;
use crate::snapshot::LocalSnapshot;
use std::sync::Arc;
use tracing::warn;

/// Business logic of an aggregate: how events change its state.
pub trait Reducer: Send + Sync + 'static {
    /// State derived from the events
    type State: Clone + Send + Sync + 'static;

    /// State before any event has been seen.
    fn initial_state(&self) -> Self::State;

    /// Fold one event into the state.
    fn on_event(&self, state: Self::State, event: &Event) -> anyhow::Result<Self::State>;

    /// Whether `event` makes all earlier history irrelevant.
    ///
    /// A reset event is folded onto a fresh initial state instead of the
    /// current one.
    fn is_reset(&self, _event: &Event) -> bool {
        false
    }
}

fn never_reset(_event: &Event) -> bool {
    false
}

/// [`Reducer`] assembled from an initial state, a fold closure and an optional
/// reset predicate.
pub struct FnReducer<S, F, P = fn(&Event) -> bool> {
    initial: S,
    fold: F,
    reset: P,
}

impl<S, F> FnReducer<S, F> {
    /// Reducer without a reset predicate.
    pub fn new(initial: S, fold: F) -> Self {
        Self {
            initial,
            fold,
            reset: never_reset,
        }
    }
}

impl<S, F, P> FnReducer<S, F, P> {
    /// Use `reset` to detect semantic resets.
    pub fn with_reset<Q>(self, reset: Q) -> FnReducer<S, F, Q>
    where
        Q: Fn(&Event) -> bool,
    {
        FnReducer {
            initial: self.initial,
            fold: self.fold,
            reset,
        }
    }
}

impl<S, F, P> Reducer for FnReducer<S, F, P>
where
    S: Clone + Send + Sync + 'static,
    F: Fn(S, &Event) -> anyhow::Result<S> + Send + Sync + 'static,
    P: Fn(&Event) -> bool + Send + Sync + 'static,
{
    type State = S;

    fn initial_state(&self) -> S {
        self.initial.clone()
    }

    fn on_event(&self, state: S, event: &Event) -> anyhow::Result<S> {
        (self.fold)(state, event)
    }

    fn is_reset(&self, event: &Event) -> bool {
        (self.reset)(event)
    }
}

/// Applies contiguous ranges of sorted events to a head snapshot.
pub struct IncrementalReducer<R: Reducer> {
    reducer: Arc<R>,
    initial: R::State,
    head: LocalSnapshot<R::State>,
}

impl<R: Reducer> IncrementalReducer<R> {
    /// Start from the reducer's initial state.
    pub fn new(reducer: Arc<R>) -> Self {
        let initial = reducer.initial_state();
        Self {
            head: LocalSnapshot::initial(initial.clone()),
            initial,
            reducer,
        }
    }

    /// The current head.
    pub fn head(&self) -> &LocalSnapshot<R::State> {
        &self.head
    }

    /// The head a subscription starting from scratch begins with.
    pub fn initial_snapshot(&self) -> LocalSnapshot<R::State> {
        LocalSnapshot::initial(self.initial.clone())
    }

    /// The pristine initial state.
    pub fn initial_state(&self) -> &R::State {
        &self.initial
    }

    /// Whether `event` resets the state.
    pub fn is_reset(&self, event: &Event) -> bool {
        self.reducer.is_reset(event)
    }

    /// Replace the head, e.g. with a snapshot taken from a cache or store.
    pub fn set_state(&mut self, snapshot: LocalSnapshot<R::State>) {
        self.head = snapshot;
    }

    /// Fold `events[from..=to]` into the head, left to right.
    ///
    /// An empty range (`from > to`) leaves the head untouched. If the fold fails
    /// the head is left as it was before the call.
    pub fn apply_range(
        &mut self,
        events: &[Event],
        from: usize,
        to: usize,
    ) -> ReconcileResult<&LocalSnapshot<R::State>> {
        if from > to || from >= events.len() {
            return Ok(&self.head);
        }
        let to = to.min(events.len() - 1);

        let mut next = self.head.clone();
        for event in &events[from..=to] {
            if self.reducer.is_reset(event) {
                if let Some(horizon) = &next.horizon {
                    if event.key < *horizon {
                        warn!(
                            horizon = %horizon,
                            key = %event.key,
                            "Reset event sorts before the current horizon"
                        );
                        debug_assert!(false, "horizon moved backwards");
                    }
                }
                next.state = self
                    .reducer
                    .on_event(self.initial.clone(), event)
                    .map_err(|cause| fold_error(event, cause))?;
                next.cycle = 0;
                next.horizon = Some(event.key.clone());
            } else {
                next.state = self
                    .reducer
                    .on_event(next.state, event)
                    .map_err(|cause| fold_error(event, cause))?;
                next.cycle += 1;
            }
            next.watermarks.update_from(&event.key);
            next.order_key = event.key.clone();
        }

        self.head = next;
        Ok(&self.head)
    }
}

fn fold_error(event: &Event, cause: anyhow::Error) -> ReconcileError {
    ReconcileError::Fold {
        key: event.key.clone(),
        cause,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::order_key::{Offset, OrderKey, StreamId};
    use chrono::Utc;
    use serde_json::json;

    pub(crate) fn sum_reducer() -> FnReducer<i64, impl Fn(i64, &Event) -> anyhow::Result<i64>> {
        FnReducer::new(0i64, |state: i64, event: &Event| {
            Ok(state + event.payload.as_i64().unwrap_or(0))
        })
    }

    pub(crate) fn event(lamport: u64, stream: &str, offset: u64, value: serde_json::Value) -> Event {
        Event::new(OrderKey::new(lamport, stream, offset), Utc::now(), value)
    }

    #[test]
    fn test_apply_range_folds_left_to_right() {
        let mut reducer = IncrementalReducer::new(Arc::new(sum_reducer()));
        let events = vec![
            event(1, "a", 0, json!(1)),
            event(2, "b", 0, json!(1)),
            event(3, "a", 1, json!(1)),
        ];

        let head = reducer.apply_range(&events, 0, 2).unwrap();
        assert_eq!(head.state, 3);
        assert_eq!(head.cycle, 3);
        assert_eq!(head.order_key, OrderKey::new(3, "a", 1));
        assert_eq!(head.watermarks.offset(&StreamId::from("a")), Some(Offset(1)));
        assert_eq!(head.watermarks.offset(&StreamId::from("b")), Some(Offset(0)));
        assert_eq!(head.horizon, None);
    }

    #[test]
    fn test_empty_range_returns_head() {
        let mut reducer = IncrementalReducer::new(Arc::new(sum_reducer()));
        let events = vec![event(1, "a", 0, json!(5))];
        reducer.apply_range(&events, 0, 0).unwrap();

        let head = reducer.apply_range(&events, 1, 0).unwrap().clone();
        assert_eq!(head.state, 5);
        assert_eq!(reducer.apply_range(&[], 0, 0).unwrap(), &head);
    }

    #[test]
    fn test_split_ranges_match_single_range() {
        let events: Vec<_> = (0..10).map(|i| event(i + 1, "a", i, json!(i))).collect();

        let mut whole = IncrementalReducer::new(Arc::new(sum_reducer()));
        whole.apply_range(&events, 0, 9).unwrap();

        let mut split = IncrementalReducer::new(Arc::new(sum_reducer()));
        split.apply_range(&events, 0, 3).unwrap();
        split.apply_range(&events, 4, 4).unwrap();
        split.apply_range(&events, 5, 9).unwrap();

        assert_eq!(whole.head(), split.head());
    }

    #[test]
    fn test_reset_starts_from_initial_state() {
        let reducer = sum_reducer().with_reset(|e: &Event| e.tags.contains("reset"));
        let mut reducer = IncrementalReducer::new(Arc::new(reducer));
        let events = vec![
            event(1, "a", 0, json!(10)),
            event(2, "a", 1, json!(10)),
            event(3, "a", 2, json!(4)).with_tag("reset"),
            event(4, "a", 3, json!(1)),
        ];

        let head = reducer.apply_range(&events, 0, 3).unwrap();
        assert_eq!(head.state, 5);
        assert_eq!(head.cycle, 1);
        assert_eq!(head.horizon, Some(OrderKey::new(3, "a", 2)));
        assert_eq!(head.watermarks.offset(&StreamId::from("a")), Some(Offset(3)));
    }

    #[test]
    fn test_fold_failure_keeps_previous_head() {
        let failing = FnReducer::new(0i64, |state: i64, event: &Event| {
            if event.payload == json!("boom") {
                anyhow::bail!("cannot fold boom");
            }
            Ok(state + 1)
        });
        let mut reducer = IncrementalReducer::new(Arc::new(failing));
        let events = vec![
            event(1, "a", 0, json!(1)),
            event(2, "a", 1, json!(1)),
            event(3, "a", 2, json!("boom")),
        ];
        reducer.apply_range(&events, 0, 0).unwrap();

        let err = reducer.apply_range(&events, 1, 2).unwrap_err();
        match err {
            ReconcileError::Fold { key, .. } => assert_eq!(key, OrderKey::new(3, "a", 2)),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(reducer.head().state, 1);
        assert_eq!(reducer.head().order_key, OrderKey::new(1, "a", 0));
    }

    #[test]
    fn test_set_state_replaces_head() {
        let mut reducer = IncrementalReducer::new(Arc::new(sum_reducer()));
        let mut snapshot = LocalSnapshot::initial(40);
        snapshot.order_key = OrderKey::new(8, "z", 2);
        snapshot.cycle = 7;
        reducer.set_state(snapshot.clone());
        assert_eq!(reducer.head(), &snapshot);

        let head = reducer
            .apply_range(&[event(9, "z", 3, json!(2))], 0, 0)
            .unwrap();
        assert_eq!(head.state, 42);
        assert_eq!(head.cycle, 8);
        assert_eq!(reducer.initial_snapshot().state, 0);
    }
}
