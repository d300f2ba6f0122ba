//! Lifecycle events emitted by an [`AggregateStore`](crate::store::AggregateStore).
//!
//! Events are delivered over a tokio broadcast channel; the store never
//! blocks on slow subscribers, and emission with no subscribers is a no-op.

use serde_json::Value;

use crate::store::AggregateId;

/// Events emitted during the lifecycle of aggregates in a store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Every expected child key of the aggregate resolved before its deadline.
    /// Emitted exactly once per completed aggregate.
    Complete {
        id: AggregateId,
        /// Merged view of all resolved child values, in expected-key order.
        snapshot: Value,
        /// Caller-supplied context, returned unchanged.
        carrier: Value,
    },
    /// The deadline elapsed before completion. Emitted exactly once, and
    /// never after a `Complete` for the same aggregate instance.
    Timeout {
        id: AggregateId,
        /// Partial view; unresolved keys appear as `null`.
        snapshot: Value,
        carrier: Value,
    },
    /// Active-aggregate count, emitted after every create, remove,
    /// completion, timeout, and store close.
    Status { active: usize },
    /// A child payload failed to parse. Diagnostic only: the key still
    /// resolves (to `null`) and completion semantics are unaffected.
    MalformedPayload { id: AggregateId, child_key: String },
}

impl StoreEvent {
    /// The aggregate id this event concerns, if any.
    pub fn aggregate_id(&self) -> Option<&AggregateId> {
        match self {
            Self::Complete { id, .. }
            | Self::Timeout { id, .. }
            | Self::MalformedPayload { id, .. } => Some(id),
            Self::Status { .. } => None,
        }
    }

    /// Whether this event marks the end of an aggregate's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Timeout { .. })
    }
}
