// Copyright 2025 Cowboy AI, LLC.

//! Total order over events of a replicated log.
//!
//! An [`OrderKey`] combines a logical (Lamport) time, the identity of the
//! stream that produced the event, and the event's offset within that stream.
//! Keys compare lexicographically in that order, which gives every replica the
//! same total order regardless of the order in which events arrived.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical time assigned by the producing node (Lamport clock).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct LamportTime(pub u64);

/// Identity of one append-only event stream.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    /// Create a stream identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of an event within its stream, starting at zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

/// Sort key of an event: `(lamport, stream, offset)`.
///
/// Field order matters: the derived `Ord` is the lexicographic order the whole
/// system agrees on.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct OrderKey {
    /// Logical time of the event
    pub lamport: LamportTime,
    /// Stream the event belongs to
    pub stream: StreamId,
    /// Offset of the event within its stream
    pub offset: Offset,
}

impl OrderKey {
    /// Create a key from its components.
    pub fn new(lamport: u64, stream: impl Into<StreamId>, offset: u64) -> Self {
        Self {
            lamport: LamportTime(lamport),
            stream: stream.into(),
            offset: Offset(offset),
        }
    }

    /// The smallest possible key. No event produced by a live system carries it,
    /// because logical time starts at 1.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether this is the [`OrderKey::zero`] key.
    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.lamport.0, self.stream, self.offset.0)
    }
}
