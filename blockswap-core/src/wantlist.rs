//! Wantlist bookkeeping
//!
//! A wantlist maps block keys to priorities. Snapshots are ordered by
//! priority descending, with insertion order breaking ties, so the first
//! key of a batch stays first among equals.

use std::collections::HashMap;
use std::sync::Mutex;

use cid::Cid;

/// Priority assigned to the head of a batch request.
pub const MAX_PRIORITY: i32 = i32::MAX;

/// A live wantlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub key: Cid,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    priority: i32,
    seq: u64,
}

/// Single-owner wantlist. See [`ThreadSafeWantlist`] for the shared variant.
#[derive(Debug, Default)]
pub struct Wantlist {
    set: HashMap<Cid, Slot>,
    next_seq: u64,
}

impl Wantlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key`, or raise its priority to `priority` if already present.
    /// Returns true when the key was newly inserted. The insertion sequence
    /// of the first insert is preserved across priority updates.
    pub fn add(&mut self, key: Cid, priority: i32) -> bool {
        match self.set.get_mut(&key) {
            Some(slot) => {
                if priority > slot.priority {
                    slot.priority = priority;
                }
                false
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.set.insert(key, Slot { priority, seq });
                true
            }
        }
    }

    /// Remove `key`; no-op if absent. Returns true when something was removed.
    pub fn remove(&mut self, key: &Cid) -> bool {
        self.set.remove(key).is_some()
    }

    pub fn contains(&self, key: &Cid) -> Option<Entry> {
        self.set.get(key).map(|slot| Entry {
            key: *key,
            priority: slot.priority,
        })
    }

    /// Snapshot in priority-descending order, ties by insertion order.
    pub fn entries(&self) -> Vec<Entry> {
        let mut slots: Vec<(&Cid, &Slot)> = self.set.iter().collect();
        slots.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        slots
            .into_iter()
            .map(|(key, slot)| Entry {
                key: *key,
                priority: slot.priority,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Wantlist shared between the public API and the control loops.
///
/// Operations never suspend; `entries` returns a consistent snapshot taken
/// under the lock.
#[derive(Debug, Default)]
pub struct ThreadSafeWantlist {
    inner: Mutex<Wantlist>,
}

impl ThreadSafeWantlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: Cid, priority: i32) -> bool {
        self.inner.lock().unwrap().add(key, priority)
    }

    pub fn remove(&self, key: &Cid) -> bool {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn contains(&self, key: &Cid) -> Option<Entry> {
        self.inner.lock().unwrap().contains(key)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.inner.lock().unwrap().entries()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
