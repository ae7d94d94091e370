// Copyright 2025 Cowboy AI, LLC.

//! Events as observed from the replicated log, and the selector that picks the
//! events belonging to one aggregate.

use crate::order_key::OrderKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of tags attached to an event.
pub type Tags = BTreeSet<String>;

/// An immutable event of the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position of the event in the global total order
    pub key: OrderKey,
    /// Wall-clock time at which the event was created
    pub timestamp: DateTime<Utc>,
    /// Tags used to select events for aggregates
    pub tags: Tags,
    /// Application payload
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an event without tags.
    pub fn new(key: OrderKey, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            key,
            timestamp,
            tags: Tags::new(),
            payload,
        }
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Tag expression selecting the events relevant to one aggregate.
///
/// The reconciliation core never interprets it; it is handed unchanged to the
/// upstream store for both bounded and live queries so that both see the same
/// subset of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagQuery {
    /// Every event
    All,
    /// Events carrying all of the given tags
    AllOf(Tags),
    /// Events matching at least one of the alternatives
    AnyOf(Vec<TagQuery>),
}

impl TagQuery {
    /// Select events carrying every tag in `tags`.
    pub fn all_of<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        TagQuery::AllOf(tags.into_iter().map(Into::into).collect())
    }

    /// Whether `event` is selected.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            TagQuery::All => true,
            TagQuery::AllOf(tags) => tags.is_subset(&event.tags),
            TagQuery::AnyOf(alternatives) => alternatives.iter().any(|q| q.matches(event)),
        }
    }
}
