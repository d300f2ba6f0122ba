//! Buffering for child updates that arrive before their parent aggregate.
//!
//! Each parent id gets one slot holding its orphan updates in arrival order.
//! A slot lives for a fixed TTL from its first insertion; registration of
//! the parent flushes it, expiry silently drops it. The buffer itself never
//! runs timers; the owning store spawns and wires them so that expiry goes
//! through the store's mutual-exclusion domain.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::AggregateId;

/// A child update waiting for its parent aggregate to be created.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    /// Which expected sub-update this satisfies
    pub child_key: String,
    /// Raw payload, parsed only when applied
    pub raw_payload: String,
    /// When the update arrived
    pub arrived_at: DateTime<Utc>,
}

/// Buffered updates for one parent id.
struct PendingSlot {
    /// Generation tag; a stale expiry timer from a recycled id must not
    /// drop a newer slot
    instance: Uuid,
    entries: Vec<PendingUpdate>,
    expiry_timer: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.expiry_timer.take() {
            handle.abort();
        }
    }
}

/// Outcome of inserting an orphan update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingInsert {
    /// First entry for this parent id; the caller must start the expiry
    /// timer for the returned slot instance
    NewSlot(Uuid),
    /// Appended to an existing slot
    Appended,
    /// The slot is at its configured capacity; the update was dropped
    Rejected,
}

/// Holding area for updates whose parent aggregate does not yet exist.
#[derive(Default)]
pub(crate) struct PendingBuffer {
    slots: HashMap<AggregateId, PendingSlot>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an orphan update for `parent`, creating the slot on first use.
    pub fn insert(
        &mut self,
        parent: &AggregateId,
        child_key: impl Into<String>,
        raw_payload: impl Into<String>,
        cap: Option<usize>,
    ) -> PendingInsert {
        let update = PendingUpdate {
            child_key: child_key.into(),
            raw_payload: raw_payload.into(),
            arrived_at: Utc::now(),
        };

        match self.slots.get_mut(parent) {
            Some(slot) => {
                if cap.is_some_and(|cap| slot.entries.len() >= cap) {
                    return PendingInsert::Rejected;
                }
                slot.entries.push(update);
                PendingInsert::Appended
            }
            None => {
                let instance = Uuid::new_v4();
                self.slots.insert(
                    parent.clone(),
                    PendingSlot {
                        instance,
                        entries: vec![update],
                        expiry_timer: None,
                    },
                );
                PendingInsert::NewSlot(instance)
            }
        }
    }

    /// Attach the expiry timer handle for a freshly created slot.
    pub fn set_expiry_timer(&mut self, parent: &AggregateId, handle: tokio::task::JoinHandle<()>) {
        if let Some(slot) = self.slots.get_mut(parent) {
            slot.expiry_timer = Some(handle);
        } else {
            // Slot vanished between insert and wiring; don't leak the timer.
            handle.abort();
        }
    }

    /// Remove the slot for `parent` and return its entries in arrival
    /// order, aborting the expiry timer.
    pub fn take(&mut self, parent: &AggregateId) -> Option<Vec<PendingUpdate>> {
        self.slots.remove(parent).map(|mut slot| {
            if let Some(handle) = slot.expiry_timer.take() {
                handle.abort();
            }
            std::mem::take(&mut slot.entries)
        })
    }

    /// TTL expiry path: silently drop the slot for `parent`, but only if it
    /// is still the instance the timer was started for.
    pub fn expire(&mut self, parent: &AggregateId, instance: Uuid) -> bool {
        match self.slots.get(parent) {
            Some(slot) if slot.instance == instance => {
                self.slots.remove(parent);
                true
            }
            _ => false,
        }
    }

    /// Drop the slot for `parent` (removal path), aborting its timer.
    pub fn remove(&mut self, parent: &AggregateId) {
        self.slots.remove(parent);
    }

    /// Abort every expiry timer and drop all slots.
    pub fn shutdown(&mut self) {
        self.slots.clear();
    }

    /// Number of parent ids with buffered updates.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total buffered updates across all slots.
    pub fn total_entries(&self) -> usize {
        self.slots.values().map(|slot| slot.entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AggregateId {
        AggregateId::from(s)
    }

    #[test]
    fn test_first_insert_creates_slot() {
        let mut buffer = PendingBuffer::new();
        let outcome = buffer.insert(&id("R1"), "s1", "{}", None);
        assert!(matches!(outcome, PendingInsert::NewSlot(_)));
        assert_eq!(buffer.len(), 1);

        let outcome = buffer.insert(&id("R1"), "s2", "{}", None);
        assert_eq!(outcome, PendingInsert::Appended);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.total_entries(), 2);
    }

    #[test]
    fn test_take_preserves_arrival_order() {
        let mut buffer = PendingBuffer::new();
        buffer.insert(&id("R1"), "s1", "1", None);
        buffer.insert(&id("R1"), "s2", "2", None);
        buffer.insert(&id("R1"), "s1", "3", None);

        let entries = buffer.take(&id("R1")).unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.child_key.as_str()).collect();
        assert_eq!(keys, ["s1", "s2", "s1"]);
        assert!(buffer.is_empty());
        assert!(buffer.take(&id("R1")).is_none());
    }

    #[test]
    fn test_capacity_cap_rejects() {
        let mut buffer = PendingBuffer::new();
        buffer.insert(&id("R1"), "s1", "{}", Some(2));
        buffer.insert(&id("R1"), "s2", "{}", Some(2));
        let outcome = buffer.insert(&id("R1"), "s3", "{}", Some(2));
        assert_eq!(outcome, PendingInsert::Rejected);
        assert_eq!(buffer.total_entries(), 2);
    }

    #[test]
    fn test_expire_checks_instance() {
        let mut buffer = PendingBuffer::new();
        let PendingInsert::NewSlot(first) = buffer.insert(&id("R1"), "s1", "{}", None) else {
            panic!("expected new slot");
        };

        // Simulate flush followed by a fresh orphan for the same id.
        buffer.take(&id("R1"));
        buffer.insert(&id("R1"), "s1", "{}", None);

        // The stale timer's expiry must not drop the new slot.
        assert!(!buffer.expire(&id("R1"), first));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_expire_drops_matching_slot() {
        let mut buffer = PendingBuffer::new();
        let PendingInsert::NewSlot(instance) = buffer.insert(&id("R1"), "s1", "{}", None) else {
            panic!("expected new slot");
        };
        assert!(buffer.expire(&id("R1"), instance));
        assert!(buffer.is_empty());
    }
}
