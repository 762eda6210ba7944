//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., the z3fold page gauge may briefly disagree with the
//! sum of per-pool page counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space reserved by page arenas
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Physical memory committed by page arenas
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Pages currently owned by z3fold pools, across all pools
crate::sync::static_atomic! {
    pub static Z3FOLD_PAGES: Counter = Counter::new();
}
// Pages handed back to their source by a successful reclaim
crate::sync::static_atomic! {
    pub static Z3FOLD_RECLAIMED: Counter = Counter::new();
}
// MIDDLE buddies relocated to the FIRST position
crate::sync::static_atomic! {
    pub static Z3FOLD_COMPACTIONS: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time copy of the global gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub z3fold_pages: usize,
    pub z3fold_reclaimed: usize,
    pub z3fold_compactions: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.get(),
        total_committed: TOTAL_COMMITTED.get(),
        z3fold_pages: Z3FOLD_PAGES.get(),
        z3fold_reclaimed: Z3FOLD_RECLAIMED.get(),
        z3fold_compactions: Z3FOLD_COMPACTIONS.get(),
    }
}
