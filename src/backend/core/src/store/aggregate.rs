//! Aggregate definitions and state management.
//!
//! An [`Aggregate`] is one correlation unit: a fixed set of expected child
//! keys, the values resolved for them so far, and an optional deadline. The
//! owning [`AggregateStore`](super::AggregateStore) routes updates into it
//! and watches for completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for an aggregate, supplied by the caller.
///
/// Ids are opaque strings issued by the upstream system (not UUIDs), stable
/// for the aggregate's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateId(pub String);

impl AggregateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of an aggregate in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    /// Waiting for one or more expected child keys to resolve
    Pending,
    /// Every expected child key resolved before the deadline
    Complete,
    /// The deadline elapsed before completion
    TimedOut,
    /// Explicitly removed or replaced before reaching completion
    Removed,
}

impl AggregateState {
    /// Check if transition to another state is valid.
    pub fn can_transition_to(&self, target: &AggregateState) -> bool {
        use AggregateState::*;
        matches!(
            (self, target),
            (Pending, Complete) | (Pending, TimedOut) | (Pending, Removed)
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AggregateState::Complete | AggregateState::TimedOut | AggregateState::Removed
        )
    }
}

/// Defensively parse a raw child payload.
///
/// Payloads are free-form strings expected to carry JSON. Empty or
/// whitespace-only payloads resolve to `null`; a parse failure is reported
/// via `Err` so the caller can emit a diagnostic, but the policy is to
/// degrade to `null` rather than block completion on malformed data.
pub fn parse_payload(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw)
}

/// One correlation unit awaiting resolution of a fixed set of child keys.
pub struct Aggregate {
    /// Caller-supplied identifier
    id: AggregateId,

    /// Generation tag, fresh per constructed instance. Timer callbacks carry
    /// the tag they were created for and fire only on a match, so a timer
    /// leaked across a replace cannot act on the new instance.
    instance: Uuid,

    /// Expected child keys, fixed at creation, insertion order preserved
    expected_keys: Vec<String>,

    /// Resolved values per expected key. `None` means unresolved;
    /// `Some(Value::Null)` means resolved-to-null (e.g. a malformed
    /// payload). The two are distinct for completion purposes.
    resolved: HashMap<String, Option<Value>>,

    /// Opaque caller context, echoed back on completion/timeout
    carrier: Value,

    /// Relative deadline captured at creation; `None` never times out
    deadline: Option<Duration>,

    /// Current lifecycle state
    state: AggregateState,

    /// Handle of the spawned deadline timer, if any
    deadline_timer: Option<tokio::task::JoinHandle<()>>,

    /// Creation timestamp
    created_at: DateTime<Utc>,
}

impl Aggregate {
    /// Create a new pending aggregate.
    ///
    /// Duplicate keys in `expected_keys` are collapsed; a zero deadline is
    /// treated as "no deadline".
    pub fn new(
        id: AggregateId,
        expected_keys: Vec<String>,
        carrier: Value,
        deadline: Option<Duration>,
    ) -> Self {
        let mut keys = Vec::with_capacity(expected_keys.len());
        let mut resolved = HashMap::with_capacity(expected_keys.len());
        for key in expected_keys {
            if !resolved.contains_key(&key) {
                keys.push(key.clone());
                resolved.insert(key, None);
            }
        }

        let deadline = deadline.filter(|d| !d.is_zero());

        Self {
            id,
            instance: Uuid::new_v4(),
            expected_keys: keys,
            resolved,
            carrier,
            deadline,
            state: AggregateState::Pending,
            deadline_timer: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// The generation tag of this instance.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> AggregateState {
        self.state
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expected_keys(&self) -> &[String] {
        &self.expected_keys
    }

    /// The caller-supplied context, returned unchanged on completion/timeout.
    pub fn carrier(&self) -> &Value {
        &self.carrier
    }

    /// Attach the spawned deadline timer handle.
    pub(crate) fn set_deadline_timer(&mut self, handle: tokio::task::JoinHandle<()>) {
        self.deadline_timer = Some(handle);
    }

    /// Whether `child_key` is one of the expected keys.
    pub fn expects(&self, child_key: &str) -> bool {
        self.resolved.contains_key(child_key)
    }

    /// Apply a parsed child value.
    ///
    /// Ignored (returns `false`) when the key is not expected or the
    /// aggregate is no longer pending. Re-resolving an already-resolved key
    /// overwrites the value without resetting any other state.
    pub fn apply_update(&mut self, child_key: &str, parsed: Value) -> bool {
        if self.state != AggregateState::Pending {
            return false;
        }
        match self.resolved.get_mut(child_key) {
            Some(slot) => {
                *slot = Some(parsed);
                true
            }
            None => false,
        }
    }

    /// An aggregate is complete iff every expected key has resolved.
    pub fn is_complete(&self) -> bool {
        self.expected_keys
            .iter()
            .all(|key| matches!(self.resolved.get(key), Some(Some(_))))
    }

    /// Number of expected keys that have resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.expected_keys
            .iter()
            .filter(|key| matches!(self.resolved.get(*key), Some(Some(_))))
            .count()
    }

    /// Merged view of the aggregate: each expected key, in declaration
    /// order, mapped to its resolved value or `null` when unresolved.
    pub fn snapshot(&self) -> Value {
        let mut merged = serde_json::Map::with_capacity(self.expected_keys.len());
        for key in &self.expected_keys {
            let value = match self.resolved.get(key) {
                Some(Some(v)) => v.clone(),
                _ => Value::Null,
            };
            merged.insert(key.clone(), value);
        }
        Value::Object(merged)
    }

    /// Transition to a new state; invalid transitions (including any out of
    /// a terminal state) are rejected.
    pub fn transition_to(&mut self, target: AggregateState) -> bool {
        if self.state.can_transition_to(&target) {
            self.state = target;
            true
        } else {
            false
        }
    }

    /// Abort the deadline timer, if one is running. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.deadline_timer.take() {
            handle.abort();
        }
    }
}

impl Drop for Aggregate {
    fn drop(&mut self) {
        self.cancel();
    }
}
