//! Aggregate Store - the heart of Conflux.
//!
//! The `AggregateStore` is responsible for:
//! - Registering aggregates and routing child updates to them
//! - Buffering updates that arrive before their parent aggregate exists
//! - Detecting completion and enforcing deadlines
//! - Emitting lifecycle events for transport adapters
//!
//! All mutation runs under a single mutex per store instance; deadline and
//! buffer-expiry callbacks are tokio tasks that acquire the same mutex, so
//! they never interleave with a store operation. Cancelling a timer is part
//! of every state transition that removes the entity it guards.

pub mod aggregate;
pub mod pending;

pub use aggregate::{parse_payload, Aggregate, AggregateId, AggregateState};
pub use pending::PendingUpdate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{ConfluxError, ErrorCode, Result};
use crate::events::StoreEvent;
use pending::{PendingBuffer, PendingInsert};

/// Registry of active aggregates with pending-update buffering and
/// deadline enforcement.
///
/// Cheap to clone; clones share the same store. Multiple independent stores
/// (e.g. one per logical workflow) share no state.
#[derive(Clone)]
pub struct AggregateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    /// Store configuration
    config: StoreConfig,
    /// Event broadcaster
    events: broadcast::Sender<StoreEvent>,
    /// All mutable state, guarded by the store's single mutex
    state: Mutex<StoreState>,
}

struct StoreState {
    /// Active aggregates by id
    aggregates: HashMap<AggregateId, Aggregate>,
    /// Updates waiting for their parent aggregate
    pending: PendingBuffer,
    /// Set once by `close`; all operations are rejected afterwards
    closed: bool,
}

impl Default for AggregateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl AggregateStore {
    /// Create a new store.
    pub fn new(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        Self {
            inner: Arc::new(StoreInner {
                config,
                events,
                state: Mutex::new(StoreState {
                    aggregates: HashMap::new(),
                    pending: PendingBuffer::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Register an aggregate.
    ///
    /// If an aggregate with `id` already exists it is discarded and replaced:
    /// its deadline timer is aborted and no terminal event is emitted for it.
    /// Any updates buffered for `id` are applied immediately, in arrival
    /// order, through the same path as live traffic, so this call can itself
    /// complete the aggregate.
    pub async fn create_aggregate(
        &self,
        id: impl Into<AggregateId>,
        expected_keys: Vec<String>,
        carrier: Value,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let id = id.into();
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(ConfluxError::closed());
        }

        if let Some(mut previous) = state.aggregates.remove(&id) {
            // Replacement discards the prior instance silently.
            previous.cancel();
            previous.transition_to(AggregateState::Removed);
            tracing::debug!(aggregate_id = %id, "replacing existing aggregate");
        } else if let Some(cap) = inner.config.max_active_aggregates {
            if state.aggregates.len() >= cap {
                let err = ConfluxError::capacity_exceeded(id.as_str(), cap);
                err.log();
                return Err(err);
            }
        }

        let mut aggregate = Aggregate::new(id.clone(), expected_keys, carrier, deadline);
        if let Some(deadline) = aggregate.deadline() {
            let handle = inner.spawn_deadline_timer(id.clone(), aggregate.instance(), deadline);
            aggregate.set_deadline_timer(handle);
        }

        tracing::info!(
            aggregate_id = %id,
            expected_keys = aggregate.expected_keys().len(),
            deadline = ?aggregate.deadline(),
            "aggregate created"
        );

        state.aggregates.insert(id.clone(), aggregate);
        inner.emit(StoreEvent::Status {
            active: state.aggregates.len(),
        });

        if let Some(entries) = state.pending.take(&id) {
            tracing::debug!(
                aggregate_id = %id,
                buffered = entries.len(),
                "flushing buffered updates"
            );
            for entry in entries {
                inner.apply_update(&mut state, &id, &entry.child_key, &entry.raw_payload, false)?;
            }
        }

        Ok(())
    }

    /// Submit a child update for `parent_id`.
    ///
    /// Applied immediately when the aggregate exists and is pending;
    /// otherwise buffered until the parent is created or the buffer TTL
    /// elapses. Unknown child keys are silently ignored; a malformed payload
    /// resolves its key to `null` and emits a diagnostic event.
    pub async fn submit_update(
        &self,
        parent_id: impl Into<AggregateId>,
        child_key: &str,
        raw_payload: &str,
    ) -> Result<()> {
        let parent_id = parent_id.into();
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(ConfluxError::closed());
        }
        inner.apply_update(&mut state, &parent_id, child_key, raw_payload, true)
    }

    /// Remove an aggregate without emitting `Complete` or `Timeout`.
    ///
    /// Aborts its deadline timer, drops any updates buffered for the id, and
    /// emits a `Status` event. Removing an unknown id is not an error.
    pub async fn remove_aggregate(&self, id: impl Into<AggregateId>) -> Result<()> {
        let id = id.into();
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(ConfluxError::closed());
        }

        if let Some(mut aggregate) = state.aggregates.remove(&id) {
            aggregate.cancel();
            aggregate.transition_to(AggregateState::Removed);
            tracing::info!(aggregate_id = %id, "aggregate removed");
        }
        state.pending.remove(&id);

        inner.emit(StoreEvent::Status {
            active: state.aggregates.len(),
        });
        Ok(())
    }

    /// Number of active aggregates.
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.aggregates.len()
    }

    /// Number of parent ids with buffered orphan updates.
    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Tear the store down: abort every outstanding deadline and
    /// buffer-expiry timer, drop all state, and emit a final `Status`.
    /// Subsequent operations fail with `StoreClosed`. Idempotent.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;

        for aggregate in state.aggregates.values_mut() {
            aggregate.cancel();
            aggregate.transition_to(AggregateState::Removed);
        }
        state.aggregates.clear();
        state.pending.shutdown();

        self.inner.emit(StoreEvent::Status { active: 0 });
        tracing::info!("aggregate store closed");
    }
}

impl StoreInner {
    /// Emit a lifecycle event. Send errors (no subscribers) are ignored.
    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    /// The single update path, shared by live traffic and pending-buffer
    /// flushes. Caller holds the store mutex.
    ///
    /// `buffer_orphans` is false during a flush: entries left over after the
    /// aggregate completed mid-flush are dropped, not re-buffered.
    fn apply_update(
        self: &Arc<Self>,
        state: &mut StoreState,
        parent_id: &AggregateId,
        child_key: &str,
        raw_payload: &str,
        buffer_orphans: bool,
    ) -> Result<()> {
        let completed = match state.aggregates.get_mut(parent_id) {
            Some(aggregate) => {
                // Unknown child keys are silently ignored, before parsing:
                // their payloads warrant no diagnostics either.
                if !aggregate.expects(child_key) {
                    return Ok(());
                }
                let parsed = match parse_payload(raw_payload) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::debug!(
                            aggregate_id = %parent_id,
                            child_key = child_key,
                            error = %err,
                            "malformed child payload resolved to null"
                        );
                        self.emit(StoreEvent::MalformedPayload {
                            id: parent_id.clone(),
                            child_key: child_key.to_string(),
                        });
                        Value::Null
                    }
                };

                aggregate.apply_update(child_key, parsed);
                aggregate.is_complete()
            }
            None if buffer_orphans => {
                return self.buffer_orphan(state, parent_id, child_key, raw_payload);
            }
            None => {
                tracing::debug!(
                    aggregate_id = %parent_id,
                    child_key = child_key,
                    "dropping buffered update for already-completed aggregate"
                );
                return Ok(());
            }
        };

        if completed {
            if let Some(mut aggregate) = state.aggregates.remove(parent_id) {
                // Abort the deadline timer before anything else so an
                // already-queued timeout callback can never win the race.
                aggregate.cancel();
                aggregate.transition_to(AggregateState::Complete);

                let snapshot = aggregate.snapshot();
                tracing::info!(
                    aggregate_id = %parent_id,
                    expected_keys = aggregate.expected_keys().len(),
                    "aggregate complete"
                );
                self.emit(StoreEvent::Complete {
                    id: parent_id.clone(),
                    snapshot,
                    carrier: aggregate.carrier().clone(),
                });
                self.emit(StoreEvent::Status {
                    active: state.aggregates.len(),
                });
            }
        }

        Ok(())
    }

    /// Buffer an update whose parent aggregate does not exist yet, starting
    /// the slot's expiry timer on first insertion.
    fn buffer_orphan(
        self: &Arc<Self>,
        state: &mut StoreState,
        parent_id: &AggregateId,
        child_key: &str,
        raw_payload: &str,
    ) -> Result<()> {
        let cap = self.config.max_pending_per_id;
        match state.pending.insert(parent_id, child_key, raw_payload, cap) {
            PendingInsert::NewSlot(instance) => {
                let handle = self.spawn_pending_expiry(parent_id.clone(), instance);
                state.pending.set_expiry_timer(parent_id, handle);
                tracing::debug!(
                    aggregate_id = %parent_id,
                    child_key = child_key,
                    ttl = ?self.config.pending_ttl,
                    "buffered update for unknown aggregate"
                );
                Ok(())
            }
            PendingInsert::Appended => {
                tracing::debug!(
                    aggregate_id = %parent_id,
                    child_key = child_key,
                    "buffered update for unknown aggregate"
                );
                Ok(())
            }
            PendingInsert::Rejected => {
                let err = ConfluxError::new(
                    ErrorCode::PendingCapacityExceeded,
                    "pending buffer cap reached for aggregate id",
                )
                .with_context("aggregate_id", parent_id.as_str())
                .with_context("cap", cap);
                err.log();
                Err(err)
            }
        }
    }

    /// Spawn the deadline timer for an aggregate instance.
    ///
    /// The task holds only a weak reference: dropping the store silences all
    /// outstanding timers. After waking it re-checks id, instance tag and
    /// state under the store mutex, so a stale timer never fires against a
    /// replaced or reused id.
    fn spawn_deadline_timer(
        self: &Arc<Self>,
        id: AggregateId,
        instance: Uuid,
        deadline: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            inner.fire_deadline(&mut state, &id, instance);
        })
    }

    /// Timeout path: runs under the store mutex after the deadline elapsed.
    fn fire_deadline(&self, state: &mut StoreState, id: &AggregateId, instance: Uuid) {
        let live = matches!(
            state.aggregates.get(id),
            Some(aggregate)
                if aggregate.instance() == instance
                    && aggregate.state() == AggregateState::Pending
        );
        if !live {
            return;
        }

        if let Some(mut aggregate) = state.aggregates.remove(id) {
            aggregate.cancel();
            aggregate.transition_to(AggregateState::TimedOut);

            let snapshot = aggregate.snapshot();
            tracing::warn!(
                aggregate_id = %id,
                resolved = aggregate.resolved_count(),
                expected_keys = aggregate.expected_keys().len(),
                "aggregate deadline elapsed"
            );
            self.emit(StoreEvent::Timeout {
                id: id.clone(),
                snapshot,
                carrier: aggregate.carrier().clone(),
            });
            self.emit(StoreEvent::Status {
                active: state.aggregates.len(),
            });
        }
    }

    /// Spawn the TTL expiry timer for a pending-buffer slot. Expiry is a
    /// silent drop: best-effort leak protection, not a reported failure.
    fn spawn_pending_expiry(
        self: &Arc<Self>,
        id: AggregateId,
        instance: Uuid,
    ) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let ttl = self.config.pending_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            if state.pending.expire(&id, instance) {
                tracing::debug!(aggregate_id = %id, "dropped expired buffered updates");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StoreEvent;
    use serde_json::json;

    fn store() -> AggregateStore {
        AggregateStore::new(StoreConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn completions(events: &[StoreEvent]) -> Vec<&StoreEvent> {
        events
            .iter()
            .filter(|e| matches!(e, StoreEvent::Complete { .. }))
            .collect()
    }

    fn timeouts(events: &[StoreEvent]) -> Vec<&StoreEvent> {
        events
            .iter()
            .filter(|e| matches!(e, StoreEvent::Timeout { .. }))
            .collect()
    }

    #[tokio::test]
    async fn test_complete_fires_once_after_all_keys() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate("R1", vec!["s1".into(), "s2".into()], json!({"n": 1}), None)
            .await
            .unwrap();
        store.submit_update("R1", "s1", "{\"a\":1}").await.unwrap();
        assert_eq!(store.active_count().await, 1);

        store.submit_update("R1", "s2", "{\"b\":2}").await.unwrap();
        assert_eq!(store.active_count().await, 0);

        let events = drain(&mut rx);
        let complete = completions(&events);
        assert_eq!(complete.len(), 1);
        let StoreEvent::Complete { id, snapshot, carrier } = complete[0] else {
            unreachable!();
        };
        assert_eq!(id.as_str(), "R1");
        assert_eq!(*snapshot, json!({"s1": {"a": 1}, "s2": {"b": 2}}));
        assert_eq!(*carrier, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_duplicate_key_resolution_is_idempotent() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate("R1", vec!["s1".into(), "s2".into()], Value::Null, None)
            .await
            .unwrap();
        store.submit_update("R1", "s1", "1").await.unwrap();
        store.submit_update("R1", "s1", "2").await.unwrap();
        assert_eq!(store.active_count().await, 1);

        store.submit_update("R1", "s2", "3").await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(completions(&events).len(), 1);
        let StoreEvent::Complete { snapshot, .. } = completions(&events)[0] else {
            unreachable!();
        };
        // Last write wins for the re-resolved key.
        assert_eq!(*snapshot, json!({"s1": 2, "s2": 3}));
    }

    #[tokio::test]
    async fn test_update_before_create_is_buffered_and_flushed() {
        let store = store();
        let mut rx = store.subscribe();

        store.submit_update("R1", "s1", "\"early\"").await.unwrap();
        assert_eq!(store.pending_count().await, 1);

        store
            .create_aggregate(
                "R1",
                vec!["s1".into(), "s2".into()],
                json!({"c": true}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(store.pending_count().await, 0);

        store.submit_update("R1", "s2", "\"late\"").await.unwrap();

        let events = drain(&mut rx);
        let complete = completions(&events);
        assert_eq!(complete.len(), 1);
        let StoreEvent::Complete { snapshot, carrier, .. } = complete[0] else {
            unreachable!();
        };
        assert_eq!(*snapshot, json!({"s1": "early", "s2": "late"}));
        assert_eq!(*carrier, json!({"c": true}));
    }

    #[tokio::test]
    async fn test_flush_can_complete_synchronously() {
        let store = store();
        let mut rx = store.subscribe();

        store.submit_update("R1", "s1", "1").await.unwrap();
        store.submit_update("R1", "s2", "2").await.unwrap();

        store
            .create_aggregate("R1", vec!["s1".into(), "s2".into()], Value::Null, None)
            .await
            .unwrap();

        assert_eq!(store.active_count().await, 0);
        let events = drain(&mut rx);
        assert_eq!(completions(&events).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_updates_expire_after_ttl() {
        let store = store();
        let mut rx = store.subscribe();

        store.submit_update("R2", "s1", "\"stale\"").await.unwrap();
        assert_eq!(store.pending_count().await, 1);

        // Default TTL is 30s; the slot is gone before the create at t=40s.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(store.pending_count().await, 0);

        store
            .create_aggregate("R2", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(completions(&events).is_empty());
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_removes_aggregate() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate(
                "R3",
                vec!["s1".into()],
                json!({"t": 3}),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let events = drain(&mut rx);
        let fired = timeouts(&events);
        assert_eq!(fired.len(), 1);
        let StoreEvent::Timeout { id, snapshot, carrier } = fired[0] else {
            unreachable!();
        };
        assert_eq!(id.as_str(), "R3");
        assert_eq!(*snapshot, json!({"s1": null}));
        assert_eq!(*carrier, json!({"t": 3}));
        assert_eq!(store.active_count().await, 0);

        // Status reflects the decrement.
        let last_status = events
            .iter()
            .rev()
            .find_map(|e| match e {
                StoreEvent::Status { active } => Some(*active),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_status, 0);

        // Nothing further fires.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(timeouts(&drain(&mut rx)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_deadline_suppresses_timeout() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate(
                "R1",
                vec!["s1".into()],
                Value::Null,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(999)).await;
        store.submit_update("R1", "s1", "1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = drain(&mut rx);
        assert_eq!(completions(&events).len(), 1);
        assert!(timeouts(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_discards_prior_instance() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate(
                "R4",
                vec!["s1".into()],
                json!({"gen": 1}),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        store
            .create_aggregate("R4", vec!["s2".into()], json!({"gen": 2}), None)
            .await
            .unwrap();
        assert_eq!(store.active_count().await, 1);

        // The first instance's deadline must not fire after replacement.
        tokio::time::sleep(Duration::from_secs(2)).await;

        store.submit_update("R4", "s2", "\"v\"").await.unwrap();

        let events = drain(&mut rx);
        assert!(timeouts(&events).is_empty());
        let complete = completions(&events);
        assert_eq!(complete.len(), 1);
        let StoreEvent::Complete { snapshot, carrier, .. } = complete[0] else {
            unreachable!();
        };
        assert_eq!(*snapshot, json!({"s2": "v"}));
        assert_eq!(*carrier, json!({"gen": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_deadline() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate(
                "R1",
                vec!["s1".into()],
                Value::Null,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        store.remove_aggregate("R1").await.unwrap();
        assert_eq!(store.active_count().await, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = drain(&mut rx);
        assert!(timeouts(&events).is_empty());
        assert!(completions(&events).is_empty());
    }

    #[tokio::test]
    async fn test_remove_clears_pending_slot() {
        let store = store();

        store.submit_update("R1", "s1", "1").await.unwrap();
        assert_eq!(store.pending_count().await, 1);

        store.remove_aggregate("R1").await.unwrap();
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_still_resolves() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate("R5", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap();
        store.submit_update("R5", "s1", "not-json").await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            StoreEvent::MalformedPayload { id, child_key }
                if id.as_str() == "R5" && child_key == "s1"
        )));
        let complete = completions(&events);
        assert_eq!(complete.len(), 1);
        let StoreEvent::Complete { snapshot, .. } = complete[0] else {
            unreachable!();
        };
        assert_eq!(*snapshot, json!({"s1": null}));
    }

    #[tokio::test]
    async fn test_unknown_key_is_silently_ignored() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate("R1", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap();
        store.submit_update("R1", "bogus", "1").await.unwrap();

        assert_eq!(store.active_count().await, 1);
        assert!(completions(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn test_status_emitted_on_create_and_remove() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate("R1", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap();
        store
            .create_aggregate("R2", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap();
        store.remove_aggregate("R1").await.unwrap();

        let counts: Vec<usize> = drain(&mut rx)
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Status { active } => Some(*active),
                _ => None,
            })
            .collect();
        assert_eq!(counts, [1, 2, 1]);
    }

    #[tokio::test]
    async fn test_active_aggregate_cap() {
        let store = AggregateStore::new(StoreConfig::default().with_max_active_aggregates(1));

        store
            .create_aggregate("R1", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap();
        let err = store
            .create_aggregate("R2", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CapacityExceeded);

        // Replacing an existing id is not a new slot and stays allowed.
        store
            .create_aggregate("R1", vec!["s2".into()], Value::Null, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_buffer_cap() {
        let store = AggregateStore::new(StoreConfig::default().with_max_pending_per_id(2));

        store.submit_update("R1", "s1", "1").await.unwrap();
        store.submit_update("R1", "s2", "2").await.unwrap();
        let err = store.submit_update("R1", "s3", "3").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PendingCapacityExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_everything() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_aggregate(
                "R1",
                vec!["s1".into()],
                Value::Null,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        store.submit_update("R2", "s1", "1").await.unwrap();

        store.close().await;
        assert_eq!(store.active_count().await, 0);
        assert_eq!(store.pending_count().await, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let events = drain(&mut rx);
        assert!(timeouts(&events).is_empty());
        let StoreEvent::Status { active } = events.last().unwrap() else {
            panic!("expected a final status event");
        };
        assert_eq!(*active, 0);

        let err = store
            .create_aggregate("R3", vec!["s1".into()], Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreClosed);

        // Close is idempotent.
        store.close().await;
    }
}
