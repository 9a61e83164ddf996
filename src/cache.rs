//! SlotCache and LockHandle: the public, thread-safe layer.
//!
//! `SlotCache` wraps a `SlotStore` in a structural mutex and adds lock
//! counting through linear tokens. Every `LockHandle` owns one token of
//! its slot's `AtomicCount`; returning the last token moves the slot to
//! the idle list, where the sweep may evict it.

use crate::config::CacheConfig;
use crate::reentrancy::{DebugReentrancy, ReentrancyGuard};
use crate::slot::Slot;
use crate::slot_store::{SlotId, SlotStore};
use crate::tokens::{AtomicCount, Count, Token};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash, Hasher};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use tracing::{debug, trace};

struct Shared<K, V, S> {
    store: Mutex<SlotStore<K, V, S>>,
    reentrancy: DebugReentrancy,
}

/// Structural critical section. Field order matters: the mutex guard is
/// released before the reentrancy guard.
struct Structure<'a, K, V, S> {
    store: MutexGuard<'a, SlotStore<K, V, S>>,
    _reentry: ReentrancyGuard<'a>,
}

impl<K, V, S> Shared<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn structure(&self) -> Structure<'_, K, V, S> {
        let reentry = self.reentrancy.enter();
        Structure {
            store: self.store.lock(),
            _reentry: reentry,
        }
    }

    fn unlock(&self, id: SlotId, slot: &Arc<Slot<K, V>>, token: Token<'_, AtomicCount>) {
        let evicted = {
            let mut s = self.structure();
            debug_assert!(
                s.store.get(id).is_some_and(|live| Arc::ptr_eq(live, slot)),
                "released slot is no longer owned by its cache"
            );
            if slot.count.put(token) {
                s.store.push_idle(id);
                let evicted = s.store.sweep();
                trace!(
                    idle = s.store.idle_len(),
                    evicted = evicted.len(),
                    "slot released to idle list"
                );
                evicted
            } else {
                Vec::new()
            }
        };
        // Payloads of evicted slots drop here, outside the structural lock.
        drop(evicted);
    }
}

/// A thread-safe cache of reference-counted slots with deferred eviction.
///
/// `get_lock` returns a `LockHandle` that pins its slot. When the last
/// handle for a key goes away the slot becomes idle; idle slots are kept
/// in release order and the oldest are evicted once more than
/// `size_limit` of them exist. Reacquiring an idle slot revives it with
/// its payload intact.
///
/// Cloning a `SlotCache` yields another reference to the same cache.
pub struct SlotCache<K, V, S = RandomState> {
    shared: Arc<Shared<K, V, S>>,
}

impl<K, V> SlotCache<K, V>
where
    K: Eq + Hash,
{
    /// Create a cache that retains at most `size_limit` idle slots.
    /// A limit of 0 evicts every slot as soon as it is released.
    pub fn new(size_limit: usize) -> Self {
        Self::with_hasher(size_limit, Default::default())
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        Self::new(config.size_limit)
    }
}

impl<K, V, S> SlotCache<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(size_limit: usize, hasher: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(SlotStore::with_hasher(size_limit, hasher)),
                reentrancy: DebugReentrancy::new(),
            }),
        }
    }

    /// Acquire a handle for `key`, creating a slot with a default payload
    /// on a miss. Never fails.
    pub fn get_lock(&self, key: K) -> LockHandle<K, V, S>
    where
        V: Default,
    {
        self.get_lock_with(key, |_| V::default())
    }

    /// Acquire a handle for `key`, creating the payload with `init` on a
    /// miss.
    ///
    /// `init` runs inside the structural critical section and must not
    /// call back into this cache, including by dropping one of its
    /// handles; doing so panics in debug builds and deadlocks otherwise.
    /// A handle released that way is leaked and its slot stays pinned.
    /// Expensive population belongs after the call, under the handle's
    /// value mutex.
    pub fn get_lock_with<F>(&self, key: K, init: F) -> LockHandle<K, V, S>
    where
        F: FnOnce(&K) -> V,
    {
        let (id, slot, token) = {
            let mut s = self.shared.structure();
            let (id, slot, inserted) = s.store.find_or_insert_with(key, init);
            if inserted {
                trace!(slots = s.store.len(), "slot created");
            } else if s.store.unlink_idle(id) {
                trace!(idle = s.store.idle_len(), "idle slot revived");
            }
            // 0 -> 1 only happens here, under the structural lock, right
            // after the slot left (or never joined) the idle list.
            debug_assert!(!s.store.is_idle(id));
            let token = slot.count.get();
            (id, slot, token)
        };
        LockHandle::new(Arc::clone(&self.shared), id, slot, token)
    }

    pub fn size_limit(&self) -> usize {
        self.shared.structure().store.size_limit()
    }

    /// Change the idle-slot limit and evict down to it immediately.
    /// Slots with live handles are unaffected.
    pub fn set_size_limit(&self, size_limit: usize) {
        let evicted = {
            let mut s = self.shared.structure();
            let evicted = s.store.set_size_limit(size_limit);
            debug!(size_limit, evicted = evicted.len(), "cache size limit changed");
            evicted
        };
        drop(evicted);
    }

    /// Number of slots, busy and idle.
    pub fn len(&self) -> usize {
        self.shared.structure().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots with no outstanding handles.
    pub fn idle_len(&self) -> usize {
        self.shared.structure().store.idle_len()
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shared.structure().store.find(q).is_some()
    }

    /// Keys of idle slots in eviction order (next victim first).
    pub fn idle_keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.shared
            .structure()
            .store
            .idle_iter()
            .map(|slot| slot.key.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        let s = self.shared.structure();
        s.store.check_counts();
        assert!(s.store.idle_len() <= s.store.size_limit());
    }
}

impl<K, V, S> Clone for SlotCache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V, S> fmt::Debug for SlotCache<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.shared.structure();
        f.debug_struct("SlotCache")
            .field("len", &s.store.len())
            .field("idle", &s.store.idle_len())
            .field("size_limit", &s.store.size_limit())
            .finish()
    }
}

struct Held<K, V, S> {
    cache: Arc<Shared<K, V, S>>,
    slot: Arc<Slot<K, V>>,
    id: SlotId,
    token: Token<'static, AtomicCount>,
}

/// A counted reference to one cache slot.
///
/// While any handle (or clone of it) is alive the slot is never evicted.
/// Dropping or resetting the last one makes the slot idle. The payload is
/// reached through the slot's value mutex; the cache itself never takes
/// that mutex.
///
/// `LockHandle::default()` is empty. Accessing the key or payload of an
/// empty handle panics.
pub struct LockHandle<K, V, S = RandomState>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    held: Option<Held<K, V, S>>,
}

impl<K, V, S> LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn new(
        cache: Arc<Shared<K, V, S>>,
        id: SlotId,
        slot: Arc<Slot<K, V>>,
        token: Token<'static, AtomicCount>,
    ) -> Self {
        debug_assert!(slot.lock_count() > 0, "handle built without a counted reference");
        Self {
            held: Some(Held {
                cache,
                slot,
                id,
                token,
            }),
        }
    }

    fn held(&self) -> &Held<K, V, S> {
        match &self.held {
            Some(h) => h,
            None => panic!("access through an empty LockHandle"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_none()
    }

    /// Release this handle's reference. Idempotent.
    pub fn reset(&mut self) {
        if let Some(Held {
            cache,
            slot,
            id,
            token,
        }) = self.held.take()
        {
            cache.unlock(id, &slot, token);
        }
    }

    pub fn key(&self) -> &K {
        &self.held().slot.key
    }

    /// Mutex guarding the payload.
    pub fn value_mutex(&self) -> &Mutex<V> {
        &self.held().slot.value
    }

    /// Lock the payload for exclusive access.
    pub fn lock(&self) -> MutexGuard<'_, V> {
        self.value_mutex().lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, V>> {
        self.value_mutex().try_lock()
    }

    /// Outstanding handles for this slot, including this one. 0 if empty.
    pub fn lock_count(&self) -> usize {
        self.held
            .as_ref()
            .map(|h| h.slot.lock_count())
            .unwrap_or(0)
    }
}

impl<K, T, S> LockHandle<K, Option<T>, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Return the payload, populating an empty one with `init` first.
    ///
    /// Runs under the value mutex, so concurrent holders of the same slot
    /// populate it once. On error the payload stays empty and the error is
    /// returned; a later call retries.
    pub fn get_or_try_init<E, F>(&self, init: F) -> Result<MappedMutexGuard<'_, T>, E>
    where
        F: FnOnce(&K) -> Result<T, E>,
    {
        let mut guard = self.lock();
        let value = match guard.take() {
            Some(v) => v,
            None => init(self.key())?,
        };
        Ok(MutexGuard::map(guard, move |payload| payload.insert(value)))
    }
}

impl<K, V, S> Default for LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn default() -> Self {
        Self { held: None }
    }
}

impl<K, V, S> Clone for LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn clone(&self) -> Self {
        match &self.held {
            None => Self::default(),
            // The count is at least 1 (ours), so this never crosses zero
            // and needs no structural lock.
            Some(h) => Self {
                held: Some(Held {
                    cache: Arc::clone(&h.cache),
                    slot: Arc::clone(&h.slot),
                    id: h.id,
                    token: h.slot.count.get(),
                }),
            },
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if *self != *source {
            *self = source.clone();
        }
    }
}

impl<K, V, S> Drop for LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn drop(&mut self) {
        self.reset();
    }
}

impl<K, V, S> PartialEq for LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        match (&self.held, &other.held) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(&a.slot, &b.slot),
            _ => false,
        }
    }
}

impl<K, V, S> Eq for LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
}

impl<K, V, S> Hash for LockHandle<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.held
            .as_ref()
            .map(|h| Arc::as_ptr(&h.slot) as usize)
            .hash(state);
    }
}

impl<K, V, S> fmt::Debug for LockHandle<K, V, S>
where
    K: Eq + Hash + fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.held {
            None => f.write_str("LockHandle(empty)"),
            Some(h) => f
                .debug_struct("LockHandle")
                .field("key", &h.slot.key)
                .field("lock_count", &h.slot.lock_count())
                .finish(),
        }
    }
}
