// Copyright 2025 Cowboy AI, LLC.

//! Snapshot scheduling
//!
//! Decides, purely from an event's position since the last reset, whether the
//! state after that event is worth caching, and when a cached snapshot has aged
//! enough to be written to durable storage.
//!
//! The [`LevelScheduler`] samples positions that are powers of two, restricted
//! to every `level_step`-th level starting at `min_level`. The tag of a
//! candidate is its level, so the snapshot store keeps one slot per level and a
//! later cycle reaching the same level replaces the older snapshot.

use crate::cache::PendingSnapshot;
use crate::events::Event;
use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration of local snapshot caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Whether snapshots are taken at all
    pub enabled: bool,
    /// Lowest level (log2 of the position) that is snapshotted
    pub min_level: u32,
    /// Distance between snapshotted levels
    pub level_step: u32,
    /// How long a snapshot stays pending before it may be stored durably,
    /// measured in event time
    pub storage_delay_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_level: 10,
            level_step: 2,
            storage_delay_ms: 60 * 60 * 1000,
        }
    }
}

impl SnapshotConfig {
    /// Build the scheduler described by this configuration.
    pub fn scheduler(&self) -> Arc<dyn SnapshotScheduler> {
        if self.enabled {
            Arc::new(LevelScheduler::new(
                self.min_level,
                self.level_step,
                Duration::milliseconds(self.storage_delay_ms as i64),
            ))
        } else {
            Arc::new(NeverScheduler)
        }
    }
}

/// A position within a batch whose resulting state should be cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCandidate {
    /// Persistence slot of the snapshot
    pub tag: String,
    /// Index within the batch
    pub index: usize,
    /// Whether the snapshot may be written to durable storage once eligible
    pub persist_as_local_snapshot: bool,
}

/// Strategy deciding which states are cached and when they are persisted
pub trait SnapshotScheduler: Send + Sync {
    /// Fewer events than this since the last reset never yield a candidate.
    fn min_events_for_snapshot(&self) -> u64;

    /// Candidates within `events`, index-ascending.
    ///
    /// `cycle` is the position (1-based, counted since the last reset) of
    /// `events[0]`. Only indices strictly greater than `after` are considered.
    fn candidates(&self, cycle: u64, events: &[Event], after: Option<usize>) -> Vec<SnapshotCandidate>;

    /// Whether `pending` has waited long enough given the latest event time.
    fn is_eligible_for_storage(&self, pending: &PendingSnapshot, latest: DateTime<Utc>) -> bool;
}

/// Power-of-two scheduler with configurable level floor and spacing
#[derive(Debug, Clone)]
pub struct LevelScheduler {
    min_level: u32,
    level_step: u32,
    storage_delay: Duration,
}

impl LevelScheduler {
    /// Create a scheduler; a `level_step` of zero is treated as one.
    pub fn new(min_level: u32, level_step: u32, storage_delay: Duration) -> Self {
        Self {
            min_level,
            level_step: level_step.max(1),
            storage_delay,
        }
    }

    /// The level of `position` if it is a snapshot position.
    pub fn level_of(&self, position: u64) -> Option<u32> {
        if !position.is_power_of_two() {
            return None;
        }
        let level = position.trailing_zeros();
        (level >= self.min_level && (level - self.min_level) % self.level_step == 0).then_some(level)
    }
}

impl Default for LevelScheduler {
    fn default() -> Self {
        let config = SnapshotConfig::default();
        Self::new(
            config.min_level,
            config.level_step,
            Duration::milliseconds(config.storage_delay_ms as i64),
        )
    }
}

impl SnapshotScheduler for LevelScheduler {
    fn min_events_for_snapshot(&self) -> u64 {
        1u64.checked_shl(self.min_level).unwrap_or(u64::MAX)
    }

    fn candidates(&self, cycle: u64, events: &[Event], after: Option<usize>) -> Vec<SnapshotCandidate> {
        let first = after.map_or(0, |limit| limit + 1);
        (first..events.len())
            .filter_map(|index| {
                let position = cycle.checked_add(index as u64)?;
                self.level_of(position).map(|level| SnapshotCandidate {
                    tag: level.to_string(),
                    index,
                    persist_as_local_snapshot: true,
                })
            })
            .collect()
    }

    fn is_eligible_for_storage(&self, pending: &PendingSnapshot, latest: DateTime<Utc>) -> bool {
        latest - pending.timestamp >= self.storage_delay
    }
}

/// Scheduler for subscriptions that take no snapshots at all.
///
/// The cache never consults it because no batch reaches
/// [`SnapshotScheduler::min_events_for_snapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverScheduler;

impl SnapshotScheduler for NeverScheduler {
    fn min_events_for_snapshot(&self) -> u64 {
        u64::MAX
    }

    fn candidates(&self, _cycle: u64, _events: &[Event], _after: Option<usize>) -> Vec<SnapshotCandidate> {
        debug_assert!(false, "NeverScheduler asked for snapshot candidates");
        Vec::new()
    }

    fn is_eligible_for_storage(&self, _pending: &PendingSnapshot, _latest: DateTime<Utc>) -> bool {
        debug_assert!(false, "NeverScheduler asked about storage eligibility");
        false
    }
}
