//! Slot: one cached payload with its lock counter and value mutex.

use crate::tokens::{AtomicCount, Count};
use parking_lot::Mutex;

/// The record behind one key.
///
/// Shared between the store (long-term owner) and every live handle, so
/// the slot outlives a handle's release even if that release evicts it.
#[derive(Debug)]
pub(crate) struct Slot<K, V> {
    pub(crate) key: K,
    pub(crate) count: AtomicCount,
    pub(crate) value: Mutex<V>,
}

impl<K, V> Slot<K, V> {
    /// New slot with a zero count; the creator mints the first token.
    pub(crate) fn new(key: K, value: V) -> Self {
        Self {
            key,
            count: AtomicCount::new(0),
            value: Mutex::new(value),
        }
    }

    #[inline]
    pub(crate) fn lock_count(&self) -> usize {
        self.count.count()
    }
}
