//! Lifetime-tied linear tokens and counting traits.
//!
//! Tokens are zero-sized proofs that a unit was acquired from a
//! particular counter instance. Dropping a token panics; the only valid
//! way to dispose of it is to return it to the originating counter via
//! `Count::put`.

use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// Counts above this are treated as overflow, matching `Arc`.
const MAX_COUNT: usize = isize::MAX as usize;

/// Zero-sized, linear token tied to its originating counter via lifetime.
pub struct Token<'a, C: ?Sized> {
    _lt: PhantomData<&'a ()>,
    // `fn() -> *const C` keeps the brand without making the token !Send.
    _ctr: PhantomData<fn() -> *const C>,
}

impl<'a, C: ?Sized> Token<'a, C> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            _lt: PhantomData,
            _ctr: PhantomData,
        }
    }
}

impl<'a, C: ?Sized> Drop for Token<'a, C> {
    fn drop(&mut self) {
        // Fail fast on misuse: a token must be consumed by Count::put.
        // While unwinding the unit is leaked instead, so a panic on the
        // release path does not escalate into an abort.
        if !std::thread::panicking() {
            panic!("Token dropped without Count::put");
        }
    }
}

/// A source of counted references, enforced by linear Token flow.
pub trait Count {
    /// The token type minted by this counter.
    type Token<'a>: Sized
    where
        Self: 'a;

    /// Acquire one counted reference and return a linear token for it.
    ///
    /// Tokens are minted with a `'static` lifetime parameter; they stay
    /// branded to this counter via the type parameter and shorten
    /// covariantly when handed back to `put`.
    fn get(&self) -> Self::Token<'static>;

    /// Return (consume) a previously acquired token.
    /// Returns true if the count is now zero.
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool;

    /// Current number of outstanding tokens.
    fn count(&self) -> usize;
}

/// Thread-safe lock counter for cache slots.
///
/// Increments are lock-free. Whether a transition crosses zero is only
/// meaningful when the caller serializes zero crossings externally; the
/// slot cache does so under its structural lock.
#[derive(Debug)]
pub struct AtomicCount {
    count: AtomicUsize,
}

impl AtomicCount {
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_zero(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }
}

impl Count for AtomicCount {
    type Token<'a>
        = Token<'a, Self>
    where
        Self: 'a;

    #[inline]
    fn get(&self) -> Self::Token<'static> {
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        if old > MAX_COUNT {
            std::process::abort();
        }
        Token::<'static, Self>::new()
    }

    #[inline]
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool {
        let old = self.count.fetch_sub(1, Ordering::Release);
        assert!(old > 0, "AtomicCount underflow");
        core::mem::forget(t);
        if old == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    #[inline]
    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
