use super::stats;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Alignment of every tracked page. Large enough for the page header and for
/// any block alignment a pool is configured with in practice.
pub const PAGE_ALIGN: usize = 16;

/// Tag recorded with each tracked allocation, used for accounting and for
/// naming the owner when teardown finds a leak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    /// Pages owned by a `BlockAllocator`.
    Pool,
    /// Pages requested directly through `allocate_page`.
    Page,
    /// Heap fallback for requests above the largest size class.
    Large,
}

impl MemoryDomain {
    pub const ALL: [MemoryDomain; 3] = [MemoryDomain::Pool, MemoryDomain::Page, MemoryDomain::Large];

    #[inline]
    const fn index(self) -> usize {
        match self {
            MemoryDomain::Pool => 0,
            MemoryDomain::Page => 1,
            MemoryDomain::Large => 2,
        }
    }
}

/// Supplier of whole pages for block pools.
///
/// Pools never talk to the heap themselves; every page they own comes from and
/// goes back to one of these.
pub trait PageProvider {
    /// Return a page of at least `size` bytes aligned to [`PAGE_ALIGN`].
    /// Exhaustion is fatal; this never returns null.
    fn allocate_page(&mut self, size: usize, domain: MemoryDomain) -> NonNull<u8>;

    /// Return a page obtained from [`allocate_page`](Self::allocate_page).
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate_page` on this provider.
    /// - `ptr` must not have been freed already.
    unsafe fn free_page(&mut self, ptr: NonNull<u8>);
}

/// Metadata for one live tracked allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRecord {
    pub size: usize,
    pub align: usize,
    pub domain: MemoryDomain,
}

impl PageRecord {
    fn layout(&self) -> Layout {
        // Constructed from a Layout that was already valid at allocation time.
        Layout::from_size_align(self.size.max(1), self.align)
            .unwrap_or_else(|_| unreachable!("tracked record holds a valid layout"))
    }
}

/// General-heap page provider that records every live allocation.
///
/// Keyed by address. The map is what makes `free_page(ptr)` possible without a
/// size argument, and what teardown inspects for leaks.
#[derive(Debug, Default)]
pub struct HeapPages {
    live: HashMap<usize, PageRecord>,
    bytes_by_domain: [usize; 3],
}

impl HeapPages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` bytes aligned to `align` from the general heap and
    /// track it under `domain`.
    ///
    /// # Panics
    ///
    /// Panics if `size`/`align` do not form a valid layout. Aborts via
    /// `handle_alloc_error` if the heap is exhausted.
    pub fn allocate(&mut self, size: usize, align: usize, domain: MemoryDomain) -> NonNull<u8> {
        let record = PageRecord { size, align, domain };
        let layout = Layout::from_size_align(size.max(1), align).unwrap_or_else(|e| {
            panic!("cannot allocate {size} bytes aligned to {align}: {e}")
        });
        // Safety: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };

        self.live.insert(ptr.as_ptr() as usize, record);
        self.bytes_by_domain[domain.index()] += size;
        stats::PAGE_BYTES_TRACKED.grow(size);
        match domain {
            MemoryDomain::Pool => stats::POOL_PAGES_COMMITTED.grow(size),
            MemoryDomain::Large => stats::LARGE_BYTES_LIVE.grow(size),
            MemoryDomain::Page => {}
        }
        ptr
    }

    /// Release a tracked allocation and return its record.
    ///
    /// # Safety
    /// `ptr` must be live in this tracker: returned by
    /// [`allocate`](Self::allocate) and not yet released.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `ptr` is not tracked.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Option<PageRecord> {
        let Some(record) = self.live.remove(&(ptr.as_ptr() as usize)) else {
            debug_assert!(false, "release of untracked pointer {ptr:p}");
            return None;
        };

        // Safety: ptr came from std::alloc::alloc with this exact layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), record.layout()) };
        self.forget_bytes(&record);
        Some(record)
    }

    fn forget_bytes(&mut self, record: &PageRecord) {
        self.bytes_by_domain[record.domain.index()] -= record.size;
        stats::PAGE_BYTES_TRACKED.shrink(record.size);
        match record.domain {
            MemoryDomain::Pool => stats::POOL_PAGES_COMMITTED.shrink(record.size),
            MemoryDomain::Large => stats::LARGE_BYTES_LIVE.shrink(record.size),
            MemoryDomain::Page => {}
        }
    }

    /// Record for a live pointer, if tracked.
    #[must_use]
    pub fn get(&self, ptr: NonNull<u8>) -> Option<&PageRecord> {
        self.live.get(&(ptr.as_ptr() as usize))
    }

    /// Number of live tracked allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live bytes tracked under `domain`.
    #[must_use]
    pub fn tracked_bytes(&self, domain: MemoryDomain) -> usize {
        self.bytes_by_domain[domain.index()]
    }

    /// Iterate over live `(address, record)` pairs.
    pub fn records(&self) -> impl Iterator<Item = (usize, &PageRecord)> {
        self.live.iter().map(|(&addr, record)| (addr, record))
    }

    /// Release every tracked allocation. Returns how many there were.
    ///
    /// # Safety
    /// Nothing may use the released memory afterwards. In particular every
    /// `BlockAllocator` drawing pages from this provider must already have
    /// been emptied with `free_all` or must never touch its pages again.
    pub unsafe fn release_all(&mut self) -> usize {
        let count = self.live.len();
        for (addr, record) in std::mem::take(&mut self.live) {
            // Safety: every tracked address came from std::alloc::alloc with
            // the recorded layout and has not been released (it was still live).
            unsafe { std::alloc::dealloc(addr as *mut u8, record.layout()) };
            self.forget_bytes(&record);
        }
        count
    }
}

impl Drop for HeapPages {
    fn drop(&mut self) {
        // Safety: pools borrow their provider for every page operation, so
        // none can reach these pages once the provider is gone.
        unsafe { self.release_all() };
    }
}

impl PageProvider for HeapPages {
    fn allocate_page(&mut self, size: usize, domain: MemoryDomain) -> NonNull<u8> {
        self.allocate(size, PAGE_ALIGN, domain)
    }

    unsafe fn free_page(&mut self, ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { self.release(ptr) };
    }
}
