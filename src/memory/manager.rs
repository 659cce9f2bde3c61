use super::block::BlockAllocator;
use super::error::PoolError;
use super::pages::{HeapPages, MemoryDomain, PAGE_ALIGN, PageProvider, PageRecord};
use super::size_class::{DEFAULT_TIERS, SizeClassTable, SizeClassTier};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Configuration for `MemoryManager`. All fields have sensible defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// Page size shared by every size-class pool. Default: 8192.
    pub page_size: usize,

    /// Block alignment for every size-class pool. Must be a power of two no
    /// larger than the page alignment. Default: 4.
    pub alignment: usize,

    /// Size-class progression. Default: 4-byte steps to 96, 32-byte steps to
    /// 512, 64-byte steps to 1024.
    pub size_classes: Vec<SizeClassTier>,

    /// Alignment of heap-fallback allocations above the largest class.
    /// Default: 16.
    pub heap_alignment: usize,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            page_size: 8192,
            alignment: 4,
            size_classes: DEFAULT_TIERS.to_vec(),
            heap_alignment: 16,
        }
    }
}

/// Snapshot of one size-class pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub class_size: usize,
    pub block_size: usize,
    pub pages: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub live_blocks: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryStats {
    pub pools: Vec<PoolStats>,
    /// Bytes of pages held by size-class pools.
    pub pool_page_bytes: usize,
    /// Bytes of pages handed out through `allocate_page`.
    pub direct_page_bytes: usize,
    /// Bytes handed out by the heap fallback.
    pub large_bytes: usize,
    /// Live tracked allocations across all domains.
    pub tracked_allocations: usize,
}

/// Tracked allocations still live when the manager was finalized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeakReport {
    pub allocations: usize,
    pub bytes: usize,
}

impl LeakReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.allocations == 0
    }
}

/// Size-class router and page provider for a family of [`BlockAllocator`]s.
///
/// One manager is the allocation context for an application: create it,
/// [`initialize`](Self::initialize) it before any consumer runs, hand it to
/// consumers by reference, and [`finalize`](Self::finalize) it after every
/// consumer has released its memory. It is single-threaded; nothing inside
/// is synchronized.
///
/// Requests up to the largest size class are served by the pool of the
/// smallest class that fits. Larger requests go to the general heap. `free`
/// re-derives the route from the caller's size, never from the pointer.
pub struct MemoryManager {
    config: MemoryManagerConfig,
    table: Option<SizeClassTable>,
    pools: Vec<BlockAllocator>,
    pages: HeapPages,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryManagerConfig::default())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.release_pools();
        if !self.pages.is_empty() {
            tracing::warn!(
                allocations = self.pages.len(),
                "memory manager dropped with live tracked allocations; releasing them"
            );
        }
        // HeapPages releases whatever is left when it drops.
    }
}

impl MemoryManager {
    /// Create an uninitialized manager. Only the page API is usable until
    /// [`initialize`](Self::initialize) runs.
    #[must_use]
    pub fn new(config: MemoryManagerConfig) -> Self {
        Self {
            config,
            table: None,
            pools: Vec::new(),
            pages: HeapPages::new(),
        }
    }

    /// Create and initialize a manager in one step.
    ///
    /// # Errors
    ///
    /// See [`initialize`](Self::initialize).
    pub fn with_config(config: MemoryManagerConfig) -> Result<Self, PoolError> {
        let mut manager = Self::new(config);
        manager.initialize()?;
        Ok(manager)
    }

    /// Build the size-class lookup table and one pool per class.
    ///
    /// Calling this again on an initialized manager is a no-op, so the table
    /// and pools are exactly those of the first call.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAlignment`, `InvalidSizeClasses` or `PageTooSmall` if
    /// the configuration cannot produce valid pools. The manager stays
    /// uninitialized on error.
    pub fn initialize(&mut self) -> Result<(), PoolError> {
        if self.table.is_some() {
            return Ok(());
        }

        let config = &self.config;
        if !config.alignment.is_power_of_two() || config.alignment > PAGE_ALIGN {
            return Err(PoolError::InvalidAlignment { alignment: config.alignment });
        }
        if !config.heap_alignment.is_power_of_two() {
            return Err(PoolError::InvalidAlignment { alignment: config.heap_alignment });
        }

        let table = SizeClassTable::new(&config.size_classes)?;
        let mut pools = Vec::with_capacity(table.len());
        for &class_size in table.classes() {
            pools.push(BlockAllocator::with_config(
                &mut self.pages,
                class_size,
                config.page_size,
                config.alignment,
            )?);
        }

        tracing::debug!(
            classes = table.len(),
            max_class = table.max_class(),
            page_size = config.page_size,
            alignment = config.alignment,
            "memory manager initialized"
        );
        self.pools = pools;
        self.table = Some(table);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    #[must_use]
    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    /// Lookup table and class sizes. `None` before initialization.
    #[must_use]
    pub fn size_classes(&self) -> Option<&SizeClassTable> {
        self.table.as_ref()
    }

    #[inline]
    fn table(&self) -> &SizeClassTable {
        self.table
            .as_ref()
            .expect("MemoryManager used before initialize")
    }

    /// Size of the class that serves `size`-byte requests, or `None` if they
    /// go to the heap.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not initialized.
    #[must_use]
    pub fn size_class_for(&self, size: usize) -> Option<usize> {
        let table = self.table();
        table.class_index(size).map(|idx| table.class_size(idx))
    }

    /// The pool that serves `size`-byte requests, or `None` above the largest
    /// class.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not initialized.
    #[must_use]
    pub fn lookup_allocator(&self, size: usize) -> Option<&BlockAllocator> {
        let idx = self.table().class_index(size)?;
        self.pools.get(idx)
    }

    /// Pool index for `layout`: the class of its size rounded up to its
    /// alignment, provided that class's blocks are aligned strictly enough.
    #[inline]
    fn layout_class(&self, layout: Layout) -> Option<usize> {
        let idx = self.table().class_index(layout.pad_to_align().size())?;
        (self.pools[idx].block_alignment() >= layout.align()).then_some(idx)
    }

    /// Empty every pool back into `self.pages`.
    fn release_pools(&mut self) {
        for pool in &mut self.pools {
            // Safety: every pool draws its pages from self.pages only.
            unsafe { pool.free_all(&mut self.pages) };
        }
    }

    /// Allocate `size` bytes. Pool-backed blocks are aligned to at least
    /// `config.alignment`; heap-backed ones to `config.heap_alignment`.
    /// Never returns null; heap exhaustion is fatal.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not initialized.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        match self.table().class_index(size) {
            // Safety: every pool draws its pages from self.pages only.
            Some(idx) => unsafe { self.pools[idx].alloc_bytes(size, &mut self.pages) },
            None => self
                .pages
                .allocate(size, self.config.heap_alignment, MemoryDomain::Large),
        }
    }

    /// Free memory from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this manager.
    /// - `size` must be the size passed to that `allocate` call, or any size
    ///   that maps to the same class. A size that maps elsewhere pushes the
    ///   block into the wrong pool.
    /// - `ptr` must not have been freed already.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not initialized.
    #[inline]
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        match self.table().class_index(size) {
            // Safety: forwarded caller contract.
            Some(idx) => unsafe { self.pools[idx].free(ptr) },
            // Safety: forwarded caller contract.
            None => unsafe { self.release_large(ptr, size) },
        }
    }

    /// # Safety
    /// `ptr` must be a live heap-fallback allocation of this manager.
    unsafe fn release_large(&mut self, ptr: NonNull<u8>, size: usize) {
        // Safety: forwarded caller contract.
        let record = unsafe { self.pages.release(ptr) };
        debug_assert!(
            record.is_none_or(|r| r.size == size && r.domain == MemoryDomain::Large),
            "large free of {ptr:p} with size {size} does not match {record:?}"
        );
    }

    /// Allocate memory for `layout`.
    ///
    /// The size is rounded up to the alignment and routed through the class
    /// table. If the chosen class cannot guarantee the alignment (its block
    /// size is not a multiple of it, or it exceeds what pages provide) the
    /// request goes to the heap instead. With the default configuration every
    /// class whose size is a multiple of 8 serves 8-aligned types, so `u64`,
    /// pointers, `String` and most structs stay in the pools.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not initialized.
    pub fn allocate_layout(&mut self, layout: Layout) -> NonNull<u8> {
        match self.layout_class(layout) {
            // Safety: every pool draws its pages from self.pages only.
            Some(idx) => unsafe { self.pools[idx].alloc_bytes(layout.size(), &mut self.pages) },
            None => {
                let align = layout.align().max(self.config.heap_alignment);
                self.pages.allocate(layout.size(), align, MemoryDomain::Large)
            }
        }
    }

    /// Free memory from [`allocate_layout`](Self::allocate_layout).
    ///
    /// # Safety
    /// `ptr` must come from `allocate_layout` on this manager with the same
    /// `layout`, and must not have been freed already.
    pub unsafe fn free_layout(&mut self, ptr: NonNull<u8>, layout: Layout) {
        match self.layout_class(layout) {
            // Safety: forwarded caller contract; layout_class is a pure
            // function of the layout, so this is the pool that served it.
            Some(idx) => unsafe { self.pools[idx].free(ptr) },
            // Safety: forwarded caller contract.
            None => unsafe { self.release_large(ptr, layout.size()) },
        }
    }

    /// Move `value` into pool memory and return a pointer to it.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not initialized.
    pub fn new_object<T>(&mut self, value: T) -> NonNull<T> {
        let ptr = self.allocate_layout(Layout::new::<T>()).cast::<T>();
        // Safety: ptr is fresh memory sized and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        ptr
    }

    /// Drop the object at `ptr` and return its memory.
    ///
    /// # Safety
    /// `ptr` must come from [`new_object`](Self::new_object) on this manager
    /// and must not have been deleted already.
    pub unsafe fn delete_object<T>(&mut self, ptr: NonNull<T>) {
        // Safety: ptr holds a live T (caller contract).
        unsafe {
            ptr.as_ptr().drop_in_place();
            self.free_layout(ptr.cast(), Layout::new::<T>());
        }
    }

    /// Allocate a raw page of `size` bytes from the general heap, tracked
    /// under [`MemoryDomain::Page`].
    pub fn allocate_page(&mut self, size: usize) -> NonNull<u8> {
        self.allocate_page_in(size, MemoryDomain::Page)
    }

    /// Allocate a raw tracked page tagged with `domain`.
    pub fn allocate_page_in(&mut self, size: usize, domain: MemoryDomain) -> NonNull<u8> {
        self.pages.allocate_page(size, domain)
    }

    /// Return a page from [`allocate_page`](Self::allocate_page).
    ///
    /// # Safety
    /// `ptr` must come from `allocate_page`/`allocate_page_in` on this manager
    /// and must not have been freed already.
    pub unsafe fn free_page(&mut self, ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { self.pages.release(ptr) };
    }

    /// Tracking record for a live page or large allocation.
    #[must_use]
    pub fn page_record(&self, ptr: NonNull<u8>) -> Option<&PageRecord> {
        self.pages.get(ptr)
    }

    /// Release the pages of every pool that has no live blocks. Returns the
    /// number of bytes handed back to the heap.
    pub fn trim(&mut self) -> usize {
        let mut released = 0;
        for pool in &mut self.pools {
            if pool.pages() > 0 && pool.live_blocks() == 0 {
                released += pool.pages() * pool.page_size();
                // Safety: every pool draws its pages from self.pages only.
                unsafe { pool.free_all(&mut self.pages) };
            }
        }
        tracing::debug!(bytes = released, "memory manager trimmed idle pools");
        released
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let pools = match &self.table {
            Some(table) => table
                .classes()
                .iter()
                .zip(&self.pools)
                .map(|(&class_size, pool)| PoolStats {
                    class_size,
                    block_size: pool.block_size(),
                    pages: pool.pages(),
                    blocks: pool.blocks(),
                    free_blocks: pool.free_blocks(),
                    live_blocks: pool.live_blocks(),
                })
                .collect(),
            None => Vec::new(),
        };

        MemoryStats {
            pools,
            pool_page_bytes: self.pages.tracked_bytes(MemoryDomain::Pool),
            direct_page_bytes: self.pages.tracked_bytes(MemoryDomain::Page),
            large_bytes: self.pages.tracked_bytes(MemoryDomain::Large),
            tracked_allocations: self.pages.len(),
        }
    }

    /// Tear down the pools and lookup table and report tracked allocations
    /// that are still live.
    ///
    /// Blocks still held by callers are invalidated along with their pools;
    /// only direct pages and large allocations count as leaks. Leaked
    /// allocations stay tracked and are released when the manager drops.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if the manager is not initialized.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if anything leaked.
    pub fn finalize(&mut self) -> Result<LeakReport, PoolError> {
        if self.table.take().is_none() {
            return Err(PoolError::NotInitialized);
        }
        self.release_pools();
        self.pools.clear();

        let report = LeakReport {
            allocations: self.pages.len(),
            bytes: MemoryDomain::ALL
                .iter()
                .map(|&domain| self.pages.tracked_bytes(domain))
                .sum(),
        };

        if report.is_clean() {
            tracing::debug!("memory manager finalized");
        } else {
            for (addr, record) in self.pages.records() {
                tracing::warn!(
                    address = format_args!("{addr:#x}"),
                    size = record.size,
                    domain = ?record.domain,
                    "leaked tracked allocation"
                );
            }
            debug_assert!(
                false,
                "memory leak at finalize: {} allocations, {} bytes",
                report.allocations, report.bytes
            );
        }
        Ok(report)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        MemoryManager::with_config(MemoryManagerConfig::default()).unwrap()
    }

    fn pool_for(manager: &MemoryManager, class_size: usize) -> PoolStats {
        manager
            .stats()
            .pools
            .into_iter()
            .find(|p| p.class_size == class_size)
            .unwrap()
    }

    #[test]
    fn test_initialize_builds_one_pool_per_class() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let manager = manager();
        let stats = manager.stats();
        assert_eq!(stats.pools.len(), 45);
        for pool in &stats.pools {
            assert!(pool.block_size >= pool.class_size);
            assert_eq!(pool.pages, 0);
        }
        assert_eq!(manager.size_classes().unwrap().max_class(), 1024);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut once = manager();
        let mut twice = manager();
        twice.initialize().unwrap();

        assert_eq!(once.size_classes(), twice.size_classes());
        assert_eq!(once.stats(), twice.stats());

        // A second initialize must not rebuild pools that already hold pages.
        let ptr = once.allocate(40);
        once.initialize().unwrap();
        assert_eq!(pool_for(&once, 40).live_blocks, 1);
        // Safety: Test code.
        unsafe { once.free(ptr, 40) };
    }

    #[test]
    fn test_allocate_50_routes_to_52_byte_class() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        assert_eq!(manager.size_class_for(50), Some(52));

        let ptr = manager.allocate(50);
        let pool = pool_for(&manager, 52);
        assert_eq!(pool.live_blocks, 1);
        assert_eq!(pool.pages, 1);
        assert_eq!(manager.stats().pools.iter().map(|p| p.live_blocks).sum::<usize>(), 1);

        // Safety: Test code.
        unsafe { manager.free(ptr, 50) };
        assert_eq!(pool_for(&manager, 52).live_blocks, 0);
    }

    #[test]
    fn test_allocate_above_max_class_uses_heap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        assert_eq!(manager.size_class_for(2000), None);
        assert!(manager.lookup_allocator(2000).is_none());

        let ptr = manager.allocate(2000);
        let stats = manager.stats();
        assert!(stats.pools.iter().all(|p| p.pages == 0));
        assert_eq!(stats.large_bytes, 2000);
        assert_eq!(
            manager.page_record(ptr).map(|r| r.domain),
            Some(MemoryDomain::Large)
        );
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        // Safety: Test code.
        unsafe { manager.free(ptr, 2000) };
        assert_eq!(manager.stats().large_bytes, 0);
        assert_eq!(manager.stats().tracked_allocations, 0);
    }

    #[test]
    fn test_class_boundaries() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        assert_eq!(manager.size_class_for(0), Some(4));
        assert_eq!(manager.size_class_for(1024), Some(1024));
        assert_eq!(manager.size_class_for(1025), None);

        let zero = manager.allocate(0);
        let max = manager.allocate(1024);
        assert_eq!(pool_for(&manager, 4).live_blocks, 1);
        assert_eq!(pool_for(&manager, 1024).live_blocks, 1);
        assert_eq!(manager.stats().large_bytes, 0);
        // Safety: Test code.
        unsafe {
            manager.free(zero, 0);
            manager.free(max, 1024);
        }
    }

    #[test]
    fn test_free_with_same_class_size_returns_to_same_pool() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let ptr = manager.allocate(49);
        // 49 and 52 share a class.
        // Safety: Test code.
        unsafe { manager.free(ptr, 52) };
        assert_eq!(pool_for(&manager, 52).live_blocks, 0);
        assert_eq!(manager.allocate(51), ptr);
    }

    #[test]
    fn test_lookup_allocator_matches_class() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let manager = manager();
        let pool = manager.lookup_allocator(50).unwrap();
        assert_eq!(pool.block_size(), 52);
        assert_eq!(pool.blocks_per_page(), (8192 - 8) / 52);
        let pool = manager.lookup_allocator(3).unwrap();
        assert_eq!(pool.block_size(), 8);
    }

    #[test]
    fn test_round_trip_every_class() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let classes = manager.size_classes().unwrap().classes().to_vec();
        let mut live = Vec::new();
        for (i, &size) in classes.iter().enumerate() {
            let ptr = manager.allocate(size);
            // Safety: Test code.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), i as u8, size) };
            live.push((ptr, size, i as u8));
        }
        for &(ptr, size, tag) in &live {
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == tag), "class {size} corrupted");
        }
        for (ptr, size, _) in live {
            // Safety: Test code.
            unsafe { manager.free(ptr, size) };
        }
    }

    #[test]
    fn test_new_and_delete_run_constructor_and_destructor() {
        use std::cell::Cell;
        use std::rc::Rc;

        struct Tracked {
            id: u32,
            drops: Rc<Cell<u32>>,
        }
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.drops.set(self.drops.get() + 1);
            }
        }

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let drops = Rc::new(Cell::new(0));
        let ptr = manager.new_object(Tracked { id: 7, drops: drops.clone() });
        // Safety: Test code.
        assert_eq!(unsafe { ptr.as_ref() }.id, 7);
        assert_eq!(pool_for(&manager, 16).live_blocks, 1);

        // Safety: Test code.
        unsafe { manager.delete_object(ptr) };
        assert_eq!(drops.get(), 1);
        assert!(manager.stats().pools.iter().all(|p| p.live_blocks == 0));
        assert_eq!(manager.stats().tracked_allocations, 0);
    }

    #[test]
    fn test_new_small_type_uses_pool() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let ptr = manager.new_object([1u16, 2, 3]);
        assert_eq!(pool_for(&manager, 8).live_blocks, 1);
        // Safety: Test code.
        unsafe {
            assert_eq!(ptr.as_ref(), &[1, 2, 3]);
            manager.delete_object(ptr);
        }
        assert_eq!(pool_for(&manager, 8).live_blocks, 0);
    }

    #[test]
    fn test_new_word_aligned_types_use_pools() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let word = manager.new_object(0u64);
        let text = manager.new_object(String::from("pooled"));
        assert_eq!(word.as_ptr() as usize % 8, 0);
        assert_eq!(text.as_ptr() as usize % 8, 0);
        assert_eq!(pool_for(&manager, 8).live_blocks, 1);
        assert_eq!(pool_for(&manager, 24).live_blocks, 1);
        assert_eq!(manager.stats().large_bytes, 0);

        // Safety: Test code.
        unsafe {
            assert_eq!(text.as_ref(), "pooled");
            manager.delete_object(word);
            manager.delete_object(text);
        }
        assert!(manager.stats().pools.iter().all(|p| p.live_blocks == 0));
        assert_eq!(manager.stats().tracked_allocations, 0);
    }

    #[test]
    fn test_layout_rounds_size_up_to_alignment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        // 41 bytes at 8-byte alignment needs a 48-byte, 8-aligned block.
        let layout = Layout::from_size_align(41, 8).unwrap();
        let ptr = manager.allocate_layout(layout);
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        assert_eq!(pool_for(&manager, 48).live_blocks, 1);
        assert_eq!(pool_for(&manager, 44).live_blocks, 0);
        // Safety: Test code.
        unsafe { manager.free_layout(ptr, layout) };
        assert_eq!(pool_for(&manager, 48).live_blocks, 0);
    }

    #[test]
    fn test_layout_with_misaligned_class_uses_heap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = MemoryManagerConfig {
            size_classes: vec![SizeClassTier::new(12, 96)],
            ..MemoryManagerConfig::default()
        };
        let mut manager = MemoryManager::with_config(config).unwrap();
        assert_eq!(manager.lookup_allocator(8).unwrap().block_alignment(), 4);

        let word = manager.new_object(5u64);
        assert_eq!(word.as_ptr() as usize % 8, 0);
        assert_eq!(manager.stats().large_bytes, 8);
        // 24-byte blocks are 8-aligned, so this one stays pooled.
        let pair = manager.new_object([1u64, 2, 3]);
        assert_eq!(pool_for(&manager, 24).live_blocks, 1);

        // Safety: Test code.
        unsafe {
            manager.delete_object(word);
            manager.delete_object(pair);
        }
        assert_eq!(manager.stats().tracked_allocations, 0);
    }

    #[test]
    fn test_sixteen_byte_alignment_pools_when_configured() {
        #[repr(align(16))]
        struct Quad([u32; 4]);

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut plain = manager();
        let ptr = plain.new_object(Quad([1; 4]));
        assert_eq!(plain.stats().large_bytes, 16);
        // Safety: Test code.
        unsafe { plain.delete_object(ptr) };

        let config = MemoryManagerConfig {
            alignment: 16,
            size_classes: vec![SizeClassTier::new(16, 256)],
            ..MemoryManagerConfig::default()
        };
        let mut aligned = MemoryManager::with_config(config).unwrap();
        let ptr = aligned.new_object(Quad([2; 4]));
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(aligned.stats().large_bytes, 0);
        assert_eq!(pool_for(&aligned, 16).live_blocks, 1);
        // Safety: Test code.
        unsafe {
            assert_eq!(ptr.as_ref().0, [2; 4]);
            aligned.delete_object(ptr);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "does not match")]
    fn test_large_free_with_wrong_size_asserts_in_debug() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let ptr = manager.allocate(2000);
        // Safety: the record is released with its own layout before the
        // size check fires.
        unsafe { manager.free(ptr, 3000) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "untracked pointer")]
    fn test_large_free_of_foreign_pointer_asserts_in_debug() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let mut local = [0u8; 8];
        // Safety: release asserts before touching the pointer.
        unsafe { manager.free(NonNull::from(&mut local).cast(), 2000) };
    }

    #[test]
    fn test_new_over_aligned_type_uses_heap() {
        #[repr(align(64))]
        struct Wide([u8; 64]);

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let ptr = manager.new_object(Wide([3; 64]));
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(manager.stats().large_bytes, 64);
        assert!(manager.stats().pools.iter().all(|p| p.pages == 0));
        // Safety: Test code.
        unsafe {
            assert_eq!(ptr.as_ref().0[63], 3);
            manager.delete_object(ptr);
        }
        assert_eq!(manager.stats().tracked_allocations, 0);
    }

    #[test]
    fn test_allocate_page_is_tracked() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let page = manager.allocate_page(65536);
        assert_eq!(manager.stats().direct_page_bytes, 65536);
        assert_eq!(
            manager.page_record(page),
            Some(&PageRecord {
                size: 65536,
                align: crate::memory::pages::PAGE_ALIGN,
                domain: MemoryDomain::Page
            })
        );
        // Safety: Test code.
        unsafe { manager.free_page(page) };
        assert_eq!(manager.stats().direct_page_bytes, 0);
        assert!(manager.finalize().unwrap().is_clean());
    }

    #[test]
    fn test_page_api_works_before_initialize() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = MemoryManager::default();
        assert!(!manager.is_initialized());
        let page = manager.allocate_page_in(4096, MemoryDomain::Pool);
        // Safety: Test code.
        unsafe { manager.free_page(page) };
        assert_eq!(manager.stats().tracked_allocations, 0);
        assert!(manager.stats().pools.is_empty());
    }

    #[test]
    fn test_finalize_releases_pools() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let a = manager.allocate(100);
        let b = manager.allocate(900);
        // Safety: Test code.
        unsafe {
            manager.free(a, 100);
            manager.free(b, 900);
        }
        assert_eq!(manager.stats().pool_page_bytes, 2 * 8192);

        let report = manager.finalize().unwrap();
        assert_eq!(report, LeakReport::default());
        assert!(!manager.is_initialized());
        assert_eq!(manager.stats().pool_page_bytes, 0);
        assert_eq!(manager.stats().tracked_allocations, 0);
    }

    #[test]
    fn test_finalize_twice_is_an_error() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        manager.finalize().unwrap();
        assert_eq!(manager.finalize(), Err(PoolError::NotInitialized));
        assert_eq!(MemoryManager::default().finalize(), Err(PoolError::NotInitialized));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "memory leak at finalize")]
    fn test_finalize_detects_leaked_page_in_debug() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        manager.allocate_page(4096);
        let _ = manager.finalize();
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_finalize_reports_leaks_in_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        manager.allocate_page(4096);
        manager.allocate(5000);
        let report = manager.finalize().unwrap();
        assert_eq!(report.allocations, 2);
        assert_eq!(report.bytes, 4096 + 5000);
    }

    #[test]
    fn test_drop_releases_leaked_allocations() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        manager.allocate_page(4096);
        manager.allocate(3000);
        manager.allocate(10);
        drop(manager);
    }

    #[test]
    fn test_trim_releases_only_idle_pools() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = manager();
        let held = manager.allocate(16);
        let freed = manager.allocate(256);
        // Safety: Test code.
        unsafe { manager.free(freed, 256) };

        assert_eq!(manager.trim(), 8192);
        assert_eq!(pool_for(&manager, 256).pages, 0);
        assert_eq!(pool_for(&manager, 16).pages, 1);
        assert_eq!(manager.trim(), 0);

        // Safety: Test code.
        unsafe { manager.free(held, 16) };
        assert_eq!(manager.trim(), 8192);
        assert_eq!(manager.stats().pool_page_bytes, 0);
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let config = MemoryManagerConfig {
            page_size: 64,
            ..MemoryManagerConfig::default()
        };
        assert!(matches!(
            MemoryManager::with_config(config),
            Err(PoolError::PageTooSmall { .. })
        ));

        let config = MemoryManagerConfig {
            size_classes: vec![SizeClassTier::new(0, 64)],
            ..MemoryManagerConfig::default()
        };
        assert!(matches!(
            MemoryManager::with_config(config),
            Err(PoolError::InvalidSizeClasses(_))
        ));

        let config = MemoryManagerConfig {
            heap_alignment: 12,
            ..MemoryManagerConfig::default()
        };
        assert_eq!(
            MemoryManager::with_config(config).err(),
            Some(PoolError::InvalidAlignment { alignment: 12 })
        );

        let config = MemoryManagerConfig {
            alignment: 3,
            ..MemoryManagerConfig::default()
        };
        let mut manager = MemoryManager::new(config);
        assert!(manager.initialize().is_err());
        assert!(!manager.is_initialized());
    }

    #[test]
    fn test_custom_progression() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = MemoryManagerConfig {
            page_size: 4096,
            alignment: 8,
            size_classes: vec![SizeClassTier::new(16, 64), SizeClassTier::new(64, 256)],
            heap_alignment: 16,
        };
        let mut manager = MemoryManager::with_config(config).unwrap();
        assert_eq!(
            manager.size_classes().unwrap().classes(),
            &[16, 32, 48, 64, 128, 192, 256]
        );
        let ptr = manager.allocate(100);
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        assert_eq!(pool_for(&manager, 128).live_blocks, 1);
        // Safety: Test code.
        unsafe { manager.free(ptr, 100) };
    }

    #[test]
    #[should_panic(expected = "before initialize")]
    fn test_allocate_before_initialize_panics() {
        let mut manager = MemoryManager::default();
        manager.allocate(8);
    }
}
