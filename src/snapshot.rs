// Copyright 2025 Cowboy AI, LLC.

//! Local snapshots of derived state and the codec that serializes them.

use crate::errors::ReconcileResult;
use crate::order_key::OrderKey;
use crate::watermark::WatermarkMap;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Identity of an aggregate for snapshot storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct AggregateId {
    /// Kind of aggregate (e.g. "inventory")
    pub kind: String,
    /// Instance name within the kind
    pub name: String,
    /// Version of the state schema; snapshots of other versions are ignored
    pub version: u32,
}

impl AggregateId {
    /// Create an aggregate identity.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@v{}", self.kind, self.name, self.version)
    }
}

/// Derived state together with the exact position in the log it reflects.
///
/// `order_key` is the key of the last event folded into `state`, `watermarks`
/// covers exactly the folded events, `cycle` counts events folded since the last
/// reset and `horizon` is the key of that reset, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSnapshot<S> {
    /// The derived state
    pub state: S,
    /// Watermarks of the events folded into `state`
    pub watermarks: WatermarkMap,
    /// Number of events folded since the last reset
    pub cycle: u64,
    /// Key of the last folded event
    pub order_key: OrderKey,
    /// Key of the most recent reset event
    pub horizon: Option<OrderKey>,
}

/// A snapshot whose state is held in serialized form.
pub type SerializedSnapshot = LocalSnapshot<String>;

impl<S> LocalSnapshot<S> {
    /// The head before any event has been folded.
    pub fn initial(state: S) -> Self {
        Self {
            state,
            watermarks: WatermarkMap::empty(),
            cycle: 0,
            order_key: OrderKey::zero(),
            horizon: None,
        }
    }

    /// Whether a conflict spanning `low..=high` leaves this snapshot intact.
    ///
    /// True if the snapshot was taken before `low`, or if its horizon lies
    /// beyond `high` so that nothing in the conflict can influence it.
    pub fn survives_conflict(&self, low: &OrderKey, high: &OrderKey) -> bool {
        self.order_key < *low || self.horizon.as_ref().is_some_and(|horizon| horizon > high)
    }

    /// Convert the state, keeping the position information.
    pub fn try_map_state<T, E>(self, f: impl FnOnce(S) -> Result<T, E>) -> Result<LocalSnapshot<T>, E> {
        Ok(LocalSnapshot {
            state: f(self.state)?,
            watermarks: self.watermarks,
            cycle: self.cycle,
            order_key: self.order_key,
            horizon: self.horizon,
        })
    }
}

/// Caller- or cache-supplied point to resume a subscription from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FixedStart {
    /// Events covered by these watermarks are not delivered again
    pub from: WatermarkMap,
    /// Key of the latest event already accounted for
    pub latest_key: OrderKey,
    /// Horizon in effect at that point
    pub horizon: Option<OrderKey>,
}

impl FixedStart {
    /// A snapshot of `state` positioned at this start point.
    pub fn snapshot<S>(&self, state: S) -> LocalSnapshot<S> {
        LocalSnapshot {
            state,
            watermarks: self.from.clone(),
            cycle: 0,
            order_key: self.latest_key.clone(),
            horizon: self.horizon.clone(),
        }
    }
}

/// Converts aggregate state to and from the serialized form kept in caches and
/// snapshot stores.
///
/// Keeping only serialized state in the cache means callers can never mutate a
/// cached snapshot through a shared reference.
pub trait StateCodec<S>: Send + Sync {
    /// Serialize a state value
    fn encode(&self, state: &S) -> ReconcileResult<String>;

    /// Deserialize a state value
    fn decode(&self, data: &str) -> ReconcileResult<S>;

    /// Serialize the state of a snapshot.
    fn encode_snapshot(&self, snapshot: &LocalSnapshot<S>) -> ReconcileResult<SerializedSnapshot> {
        Ok(LocalSnapshot {
            state: self.encode(&snapshot.state)?,
            watermarks: snapshot.watermarks.clone(),
            cycle: snapshot.cycle,
            order_key: snapshot.order_key.clone(),
            horizon: snapshot.horizon.clone(),
        })
    }

    /// Deserialize the state of a snapshot.
    fn decode_snapshot(&self, snapshot: SerializedSnapshot) -> ReconcileResult<LocalSnapshot<S>> {
        snapshot.try_map_state(|data| self.decode(&data))
    }
}

/// JSON codec for any serde-compatible state.
pub struct JsonCodec<S>(PhantomData<fn() -> S>);

impl<S> JsonCodec<S> {
    /// Create a JSON codec.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for JsonCodec<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> StateCodec<S> for JsonCodec<S>
where
    S: Serialize + DeserializeOwned,
{
    fn encode(&self, state: &S) -> ReconcileResult<String> {
        Ok(serde_json::to_string(state)?)
    }

    fn decode(&self, data: &str) -> ReconcileResult<S> {
        Ok(serde_json::from_str(data)?)
    }
}
