//! slot-cache: a thread-safe, keyed cache of reference-counted slots with
//! deferred, release-ordered eviction.
//!
//! Intended for expensive per-key resources (open files, parsed
//! metadata) shared by concurrent readers: callers take a `LockHandle`
//! for a key, and the resource stays cached while any handle is alive.
//! When the last handle goes away the slot is not destroyed but parked
//! on an idle list; it is revived intact if requested again, and only
//! the oldest idle slots beyond `size_limit` are evicted.
//!
//! Keys must be `Eq + Hash`; they are indexed by hash, not by order, so
//! a key type that is only `Ord` needs a `Hash` impl (or a wrapper) to
//! be used here. Payloads need no bounds beyond `Send` for sharing
//! across threads.
//!
//! Internal Design:
//!
//! Summary
//! - Layers:
//!   - SlotStore<K, V, S>: structural map. A generational arena of slots
//!     indexed by key hash, plus an intrusive FIFO of idle slots threaded
//!     through the arena as `prev`/`next` ids. Single-threaded.
//!   - tokens: `AtomicCount` per slot; every outstanding handle owns one
//!     linear `Token` that must be returned through `Count::put`.
//!   - SlotCache<K, V, S>: public API. Guards the store with one
//!     structural mutex and hands out `LockHandle`s; returning the last
//!     token idles the slot and runs the eviction sweep.
//!
//! Locking
//! - Structural mutex: protects the arena, the index and the idle list.
//!   Held only for lookups, splices and removals.
//! - Value mutex: one per slot, owns the payload. The cache never takes
//!   it, so populating a payload does not block other keys.
//! - Lock counts change from 0 to 1 and from 1 to 0 only under the
//!   structural mutex. Cloning a handle increments without it; the clone
//!   source already holds a count, so no zero crossing can be missed.
//!
//! Eviction
//! - Release order, not touch order: a slot joins the idle list tail when
//!   its count drops to zero and leaves it when revived. The sweep pops
//!   from the head while more than `size_limit` slots are idle.
//! - Busy slots are never evicted and never count against the limit.
//! - Evicted slots are unlinked under the structural mutex but dropped
//!   after it is released, so payload destructors may release handles of
//!   the same cache.
//!
//! Reentrancy
//! - User code run inside the structural section (`K: Eq/Hash`, the
//!   `init` closure of `get_lock_with`) must not call back into the same
//!   cache, not even to drop a handle. A debug-only guard turns such a
//!   nested entry into a panic instead of a deadlock. Tokens dropped while
//!   unwinding are leaked rather than panicking again, so the panic stays
//!   catchable; the leaked reference pins its slot.
//!
//! Overflow semantics
//! - Lock-count overflow aborts, matching `Arc`.

mod cache;
mod config;
mod reentrancy;
mod slot;
mod slot_store;
#[cfg(test)]
mod slot_store_proptest;
pub mod tokens;

// Public surface
pub use cache::{LockHandle, SlotCache};
pub use config::{CacheConfig, ConfigError, DEFAULT_SIZE_LIMIT, SIZE_LIMIT_ENV};
