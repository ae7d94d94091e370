// Copyright 2025 Cowboy AI, LLC.

//! Error types for reconciliation
//!
//! Ordering violations are not errors: time travel is an ordinary protocol
//! message. Infrastructure faults are absorbed by the subscription loop and
//! only reach callers of the lower-level components directly. The one error a
//! subscriber can observe is a failing fold, which indicates a defect in the
//! business logic.

use crate::infrastructure::event_store::EventStoreError;
use crate::infrastructure::snapshot_store::SnapshotError;
use crate::order_key::OrderKey;
use thiserror::Error;

/// Errors that can occur while reconciling derived state
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The caller-supplied fold or reset function failed
    #[error("Fold failed at event {key}: {cause:#}")]
    Fold {
        /// Key of the event being folded
        key: OrderKey,
        /// Error returned by the business logic
        cause: anyhow::Error,
    },

    /// State could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The upstream event store failed
    #[error("Event store error: {0}")]
    Store(#[from] EventStoreError),

    /// The snapshot store failed
    #[error("Snapshot store error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result type for reconciliation operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Serialization(err.to_string())
    }
}

impl ReconcileError {
    /// Whether the error stems from business logic rather than infrastructure.
    pub fn is_fold_failure(&self) -> bool {
        matches!(self, ReconcileError::Fold { .. })
    }
}
