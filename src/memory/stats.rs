//! Process-wide diagnostic gauges.
//!
//! Every `MemoryManager` in the process feeds the same gauges, so they describe
//! the whole process rather than one manager. Per-manager numbers come from
//! [`MemoryManager::stats`](super::manager::MemoryManager::stats).
//!
//! Gauges use `Relaxed` ordering and are eventually consistent. Do NOT use
//! them for allocation decisions.

use crate::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Byte gauge with a high-water mark.
///
/// A `shrink` racing ahead of its matching `grow` on another thread can drive
/// the raw value negative for a moment; [`live`](Self::live) reads it as zero.
pub struct ByteGauge {
    live: AtomicIsize,
    peak: AtomicUsize,
}

impl ByteGauge {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self { live: AtomicIsize::new(0), peak: AtomicUsize::new(0) }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self { live: AtomicIsize::new(0), peak: AtomicUsize::new(0) }
    }

    #[inline]
    fn delta(bytes: usize) -> isize {
        bytes.min(isize::MAX.cast_unsigned()).cast_signed()
    }

    /// Record `bytes` coming into use and raise the peak if needed.
    #[inline]
    pub fn grow(&self, bytes: usize) {
        let delta = Self::delta(bytes);
        let now = self.live.fetch_add(delta, Ordering::Relaxed).saturating_add(delta);
        self.peak.fetch_max(now.max(0).cast_unsigned(), Ordering::Relaxed);
    }

    /// Record `bytes` going out of use. The peak is unaffected.
    #[inline]
    pub fn shrink(&self, bytes: usize) {
        self.live.fetch_sub(Self::delta(bytes), Ordering::Relaxed);
    }

    /// Bytes currently in use, clamped at zero.
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed).max(0).cast_unsigned()
    }

    /// Largest value `live` has reached since process start.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

// Pages currently held by block pools, in bytes.
crate::sync::static_atomic! {
    pub static POOL_PAGES_COMMITTED: ByteGauge = ByteGauge::new();
}
// All page-tracked bytes (pool pages, direct pages and large allocations).
crate::sync::static_atomic! {
    pub static PAGE_BYTES_TRACKED: ByteGauge = ByteGauge::new();
}
// Bytes handed out by the heap fallback for requests above the largest class.
crate::sync::static_atomic! {
    pub static LARGE_BYTES_LIVE: ByteGauge = ByteGauge::new();
}
