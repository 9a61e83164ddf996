//! SlotStore: structural layer with stable slot ids and the idle list.
//!
//! Slots live in a generational arena; a hash index maps keys to arena
//! ids. Idle slots are threaded into a FIFO through `prev`/`next` arena
//! ids stored in their entries, so unlinking a revived slot and popping
//! the oldest idle slot are both O(1) without holding native iterators.
//!
//! The store is single-threaded and never touches lock counts itself;
//! the cache serializes every call under its structural mutex.

use crate::slot::Slot;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;
use std::sync::Arc;

/// Stable id of a slot inside one store. Stale ids never alias newer
/// slots thanks to generational keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct SlotId(DefaultKey);

#[derive(Copy, Clone, Debug)]
struct Link {
    prev: Option<DefaultKey>,
    next: Option<DefaultKey>,
}

#[derive(Debug)]
struct Entry<K, V> {
    slot: Arc<Slot<K, V>>,
    hash: u64,
    // Some iff the slot is in the idle list.
    idle: Option<Link>,
}

#[derive(Debug, Default)]
struct IdleList {
    head: Option<DefaultKey>,
    tail: Option<DefaultKey>,
    len: usize,
}

pub(crate) struct SlotStore<K, V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
    idle: IdleList,
    size_limit: usize,
}

impl<K, V, S> SlotStore<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub(crate) fn with_hasher(size_limit: usize, hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::new(),
            slots: SlotMap::with_key(),
            idle: IdleList::default(),
            size_limit,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.len
    }

    pub(crate) fn size_limit(&self) -> usize {
        self.size_limit
    }

    pub(crate) fn find<Q>(&self, q: &Q) -> Option<SlotId>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hasher.hash_one(q);
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.slot.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| SlotId(k))
    }

    /// Look up `key`, inserting a fresh slot built by `init` when absent.
    /// Returns the id, the slot and whether it was inserted. `init` only
    /// runs on insertion.
    pub(crate) fn find_or_insert_with<F>(
        &mut self,
        key: K,
        init: F,
    ) -> (SlotId, Arc<Slot<K, V>>, bool)
    where
        F: FnOnce(&K) -> V,
    {
        let hash = self.hasher.hash_one(&key);
        match self.index.entry(
            hash,
            |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.slot.key == key)
                    .unwrap_or(false)
            },
            |&k| self.slots.get(k).map(|e| e.hash).unwrap_or(0),
        ) {
            hashbrown::hash_table::Entry::Occupied(o) => {
                let k = *o.get();
                match self.slots.get(k) {
                    Some(e) => (SlotId(k), Arc::clone(&e.slot), false),
                    None => unreachable!("key index points at a removed slot"),
                }
            }
            hashbrown::hash_table::Entry::Vacant(v) => {
                let value = init(&key);
                let slot = Arc::new(Slot::new(key, value));
                let k = self.slots.insert(Entry {
                    slot: Arc::clone(&slot),
                    hash,
                    idle: None,
                });
                let _ = v.insert(k);
                (SlotId(k), slot, true)
            }
        }
    }

    pub(crate) fn get(&self, id: SlotId) -> Option<&Arc<Slot<K, V>>> {
        self.slots.get(id.0).map(|e| &e.slot)
    }

    pub(crate) fn is_idle(&self, id: SlotId) -> bool {
        self.slots
            .get(id.0)
            .map(|e| e.idle.is_some())
            .unwrap_or(false)
    }

    fn link_mut(&mut self, k: DefaultKey) -> Option<&mut Link> {
        self.slots.get_mut(k).and_then(|e| e.idle.as_mut())
    }

    /// Append a slot to the tail of the idle list.
    pub(crate) fn push_idle(&mut self, id: SlotId) {
        let k = id.0;
        let tail = self.idle.tail;
        match self.slots.get_mut(k) {
            Some(entry) => {
                debug_assert!(entry.idle.is_none(), "slot is already idle");
                entry.idle = Some(Link {
                    prev: tail,
                    next: None,
                });
            }
            None => {
                debug_assert!(false, "push_idle on a slot that is not in the store");
                return;
            }
        }
        match tail {
            Some(t) => {
                if let Some(link) = self.link_mut(t) {
                    link.next = Some(k);
                }
            }
            None => self.idle.head = Some(k),
        }
        self.idle.tail = Some(k);
        self.idle.len += 1;
    }

    /// Remove a slot from the idle list. Returns false if it was not idle.
    pub(crate) fn unlink_idle(&mut self, id: SlotId) -> bool {
        let Some(link) = self.slots.get_mut(id.0).and_then(|e| e.idle.take()) else {
            return false;
        };
        debug_assert!(self.idle.len > 0, "idle list empty while a slot is linked");
        match link.prev {
            Some(p) => {
                if let Some(prev) = self.link_mut(p) {
                    prev.next = link.next;
                }
            }
            None => self.idle.head = link.next,
        }
        match link.next {
            Some(n) => {
                if let Some(next) = self.link_mut(n) {
                    next.prev = link.prev;
                }
            }
            None => self.idle.tail = link.prev,
        }
        self.idle.len -= 1;
        true
    }

    /// Unlink and remove the oldest idle slot.
    fn pop_idle_front(&mut self) -> Option<Arc<Slot<K, V>>> {
        let head = self.idle.head?;
        self.unlink_idle(SlotId(head));
        let entry = self.slots.remove(head)?;
        match self.index.find_entry(entry.hash, |&k| k == head) {
            Ok(occupied) => {
                let _ = occupied.remove();
            }
            Err(_) => debug_assert!(false, "slot missing from key index"),
        }
        Some(entry.slot)
    }

    /// Evict oldest idle slots until at most `size_limit` remain idle.
    ///
    /// Evicted slots are returned rather than dropped so the caller can
    /// release its lock before payload destructors run.
    #[must_use]
    pub(crate) fn sweep(&mut self) -> Vec<Arc<Slot<K, V>>> {
        let mut evicted = Vec::new();
        while self.idle.len > self.size_limit {
            match self.pop_idle_front() {
                Some(slot) => evicted.push(slot),
                None => break,
            }
        }
        evicted
    }

    #[must_use]
    pub(crate) fn set_size_limit(&mut self, size_limit: usize) -> Vec<Arc<Slot<K, V>>> {
        self.size_limit = size_limit;
        self.sweep()
    }

    /// Idle slots, oldest first.
    pub(crate) fn idle_iter(&self) -> IdleIter<'_, K, V> {
        IdleIter {
            slots: &self.slots,
            cursor: self.idle.head,
        }
    }

    /// Panics unless the index, arena and idle list agree with each other.
    #[cfg(test)]
    pub(crate) fn check_links(&self) {
        assert_eq!(self.index.len(), self.slots.len(), "index and arena sizes differ");
        let mut walked = 0;
        let mut prev = None;
        let mut cursor = self.idle.head;
        while let Some(k) = cursor {
            let link = self.slots[k].idle.expect("listed slot must carry a link");
            assert_eq!(link.prev, prev, "broken prev link");
            walked += 1;
            prev = Some(k);
            cursor = link.next;
        }
        assert_eq!(prev, self.idle.tail, "tail does not end the list");
        assert_eq!(walked, self.idle.len, "idle length mismatch");
        let linked = self.slots.values().filter(|e| e.idle.is_some()).count();
        assert_eq!(linked, self.idle.len, "linked entries not all reachable");
    }

    /// Panics unless exactly the zero-count slots are idle.
    #[cfg(test)]
    pub(crate) fn check_counts(&self) {
        self.check_links();
        for e in self.slots.values() {
            assert_eq!(
                e.idle.is_some(),
                e.slot.lock_count() == 0,
                "idle membership must match a zero lock count"
            );
        }
    }
}

/// Iterator over idle slots, oldest first.
pub(crate) struct IdleIter<'a, K, V> {
    slots: &'a SlotMap<DefaultKey, Entry<K, V>>,
    cursor: Option<DefaultKey>,
}

impl<'a, K, V> Iterator for IdleIter<'a, K, V> {
    type Item = &'a Arc<Slot<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.slots.get(self.cursor?)?;
        self.cursor = entry.idle.and_then(|l| l.next);
        Some(&entry.slot)
    }
}
