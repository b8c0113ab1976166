// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::token::{RemoveToken, Token, TokenImpl, ValueToken};

/// Map key: priority plus an insertion sequence number, so that equal
/// priorities pop in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey<K> {
    priority: K,
    seq: u64,
}

/// One queued element. The slot itself is stable for the element's lifetime;
/// a priority change relocates the map entry but reuses the slot, which is
/// what lets tokens follow their element.
pub(crate) struct Slot<K, V> {
    value: V,

    /// Identity of the queue that created the slot; tokens presented to a
    /// different queue are rejected rather than corrupting either map.
    queue_id: u64,

    /// The element's current map key, `None` once popped or removed.
    ///
    /// Only written while the owning queue's map lock is held.
    position: Mutex<Option<SlotKey<K>>>,
}

impl<K, V> Slot<K, V> {
    pub(crate) fn value(&self) -> &V {
        &self.value
    }
}

/// A thread-safe priority-ordered multimap.
///
/// Lower keys pop first; equal keys pop in insertion order. Every element is
/// addressable through a token, supporting O(log n) targeted removal and
/// in-flight priority changes. See the [crate docs](crate) for an overview.
///
/// The map is guarded by a single mutex. The lock is not on a hot path in
/// the intended usage: it is taken for the duration of one `BTreeMap`
/// operation, and the workloads this queue serves (dispatch queues, deadline
/// maps) are bounded by the cost of the work items themselves rather than by
/// queue throughput.
pub struct PriorityQueue<K, V> {
    map: Mutex<BTreeMap<SlotKey<K>, Arc<Slot<K, V>>>>,
    seq: AtomicU64,
    id: u64,
}

fn next_queue_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl<K, V> Default for PriorityQueue<K, V>
where
    K: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for PriorityQueue<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.map.lock().len())
            .finish_non_exhaustive()
    }
}

impl<K, V> PriorityQueue<K, V>
where
    K: Ord + Clone,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            id: next_queue_id(),
        }
    }

    fn next_seq(&self) -> u64 {
        // Relaxed: the value only needs to be unique, and the map lock
        // orders all structural use of it.
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `value` at `priority`, returning a token that names the new
    /// element.
    pub fn insert(&self, priority: K, value: V) -> RemoveToken<K, V> {
        let key = SlotKey {
            priority,
            seq: self.next_seq(),
        };
        let slot = Arc::new(Slot {
            value,
            queue_id: self.id,
            position: Mutex::new(Some(key.clone())),
        });
        let token = RemoveToken {
            slot: Arc::downgrade(&slot),
        };
        self.map.lock().insert(key, slot);
        token
    }

    /// Removes and returns the highest-priority (least-keyed) element.
    pub fn pop(&self) -> Option<ValueToken<K, V>> {
        let mut map = self.map.lock();
        let (key, slot) = map.pop_first()?;
        *slot.position.lock() = None;
        Some(ValueToken {
            slot,
            priority: key.priority,
        })
    }

    /// Removes and returns the head element only if its priority is no worse
    /// than `bound` (numerically `<=`).
    pub fn pop_if_at_most(&self, bound: &K) -> Option<ValueToken<K, V>> {
        let mut map = self.map.lock();
        let entry = map.first_entry()?;
        if entry.key().priority > *bound {
            return None;
        }
        let (key, slot) = entry.remove_entry();
        *slot.position.lock() = None;
        Some(ValueToken {
            slot,
            priority: key.priority,
        })
    }

    /// Returns the head element without removing it.
    pub fn peek(&self) -> Option<ValueToken<K, V>> {
        let map = self.map.lock();
        let (key, slot) = map.first_key_value()?;
        Some(ValueToken {
            slot: Arc::clone(slot),
            priority: key.priority.clone(),
        })
    }

    /// Returns the head element's priority without removing it.
    pub fn peek_priority(&self) -> Option<K> {
        let map = self.map.lock();
        Some(map.first_key_value()?.0.priority.clone())
    }

    /// Removes the element a token names.
    ///
    /// Returns `true` iff this call took the element out of the queue; a
    /// token whose element was already popped, removed, or cleared yields
    /// `false`. Exactly one of any set of racing `pop`/`remove` calls
    /// observes the element.
    pub fn remove(&self, token: &impl Token<K, V>) -> bool {
        let Some(slot) = token.slot() else {
            return false;
        };
        if slot.queue_id != self.id {
            return false;
        }
        let mut map = self.map.lock();
        let mut position = slot.position.lock();
        let Some(key) = position.take() else {
            return false;
        };
        let removed = map.remove(&key);
        debug_assert!(removed.is_some());
        true
    }

    /// Moves the element a token names to `new_priority`.
    ///
    /// Returns `true` iff the element was live at the moment of relocation
    /// (including the no-op case where it already sat at `new_priority`);
    /// the token continues to name the element at its new position. Returns
    /// `false` if the element had already been popped or removed — racing a
    /// priority change against a pop, the pop's observed priority is the one
    /// that took effect.
    pub fn change_priority(&self, token: &impl Token<K, V>, new_priority: K) -> bool {
        let Some(slot) = token.slot() else {
            return false;
        };
        if slot.queue_id != self.id {
            return false;
        }
        let mut map = self.map.lock();
        let mut position = slot.position.lock();
        let Some(key) = position.clone() else {
            return false;
        };
        if key.priority == new_priority {
            return true;
        }
        let entry = map.remove(&key);
        debug_assert!(entry.is_some());
        let new_key = SlotKey {
            priority: new_priority,
            seq: self.next_seq(),
        };
        *position = Some(new_key.clone());
        map.insert(new_key, Arc::clone(&slot));
        true
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Discards every queued element.
    pub fn clear(&self) {
        let mut map = self.map.lock();
        for slot in map.values() {
            *slot.position.lock() = None;
        }
        map.clear();
    }

    /// Removes every queued element, returning them in priority order.
    pub fn drain(&self) -> Vec<ValueToken<K, V>> {
        let mut map = self.map.lock();
        let drained = std::mem::take(&mut *map);
        drained
            .into_iter()
            .map(|(key, slot)| {
                *slot.position.lock() = None;
                ValueToken {
                    slot,
                    priority: key.priority,
                }
            })
            .collect()
    }
}
