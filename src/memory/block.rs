use super::error::PoolError;
use super::fill;
use super::pages::{MemoryDomain, PAGE_ALIGN, PageProvider};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
#[cfg(debug_assertions)]
use std::collections::BTreeMap;
use std::mem::size_of;
use std::ptr::NonNull;

/// Leading bytes of every page. Pages form a singly linked chain through it.
#[repr(C)]
struct PageHeader {
    next: Option<NonNull<PageHeader>>,
}

/// Leading bytes of a block while it sits on the free list.
///
/// Blocks are only `alignment`-aligned, which may be less than pointer
/// alignment, so headers are always accessed unaligned.
#[repr(C)]
struct BlockHeader {
    next: Option<NonNull<BlockHeader>>,
}

/// Smallest block a pool hands out: a free block must hold its header.
pub const MIN_BLOCK_SIZE: usize = size_of::<BlockHeader>();

/// Bytes reserved at the start of each page for the page header.
pub const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();

/// Single-size-class pool: fixed-size blocks carved out of pages obtained from
/// a [`PageProvider`], recycled through an intrusive LIFO free list.
///
/// The pool does not own its provider. Every call that may touch pages takes
/// the provider explicitly and is `unsafe`: from the first page a pool grows
/// until the [`free_all`](Self::free_all) that releases it, every such call
/// must pass the same provider, and that provider must not have released the
/// pool's pages behind its back.
///
/// ```compile_fail
/// use poolmem::{BlockAllocator, HeapPages};
///
/// let mut pages = HeapPages::new();
/// let mut pool = BlockAllocator::with_config(&mut pages, 16, 8192, 4).unwrap();
/// // Growing a pool needs an `unsafe` promise about the provider.
/// let block = pool.alloc(&mut pages);
/// ```
///
/// Pages are only returned to the provider by `free_all` (directly or through
/// [`reset`](Self::reset)); freeing blocks never shrinks the pool.
pub struct BlockAllocator {
    block_size: usize,
    alignment_size: usize,
    page_size: usize,
    blocks_per_page: usize,
    first_block_offset: usize,
    page_list: Option<NonNull<PageHeader>>,
    free_list: Option<NonNull<BlockHeader>>,
    pages: usize,
    blocks: usize,
    free_blocks: usize,
    /// Live slots per page, keyed by page address. Catches foreign pointers
    /// and double frees.
    #[cfg(debug_assertions)]
    live_map: BTreeMap<usize, FixedBitSet>,
}

// Safety: BlockAllocator exclusively owns the pages in its chain; the raw
// pointers are never shared outside of blocks handed to callers.
unsafe impl Send for BlockAllocator {}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        // The provider still tracks the pages; dropping without free_all only
        // defers their release to the provider.
        if !std::thread::panicking() {
            debug_assert!(
                self.pages == 0,
                "BlockAllocator dropped holding {} pages; call free_all first",
                self.pages
            );
        }
    }
}

impl BlockAllocator {
    /// Unconfigured pool. Call [`reset`](Self::reset) before allocating.
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_size: 0,
            alignment_size: 0,
            page_size: 0,
            blocks_per_page: 0,
            first_block_offset: 0,
            page_list: None,
            free_list: None,
            pages: 0,
            blocks: 0,
            free_blocks: 0,
            #[cfg(debug_assertions)]
            live_map: BTreeMap::new(),
        }
    }

    /// Configured pool, equivalent to `new()` followed by `reset()`.
    ///
    /// # Errors
    ///
    /// See [`reset`](Self::reset).
    pub fn with_config<P: PageProvider>(
        pages: &mut P,
        data_size: usize,
        page_size: usize,
        alignment: usize,
    ) -> Result<Self, PoolError> {
        let mut pool = Self::new();
        // Safety: a new pool holds no pages, so no provider is bound to it yet.
        unsafe { pool.reset(pages, data_size, page_size, alignment)? };
        Ok(pool)
    }

    /// Reconfigure the pool, releasing all of its pages to `pages` first.
    ///
    /// `block_size = align_up(max(data_size, MIN_BLOCK_SIZE), alignment)`;
    /// padding is the difference. Blocks start at the page header size rounded
    /// up to `alignment`.
    ///
    /// Every block previously handed out by this pool is invalidated.
    ///
    /// # Errors
    ///
    /// - `InvalidAlignment` if `alignment` is not a power of two or exceeds
    ///   the page alignment.
    /// - `PageTooSmall` if `page_size` cannot hold the header plus one block.
    ///
    /// On error the pool keeps its previous configuration and pages.
    ///
    /// # Safety
    /// If the pool holds pages, `pages` must be the live provider they came
    /// from.
    pub unsafe fn reset<P: PageProvider>(
        &mut self,
        pages: &mut P,
        data_size: usize,
        page_size: usize,
        alignment: usize,
    ) -> Result<(), PoolError> {
        debug_assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} must be a power of two"
        );
        if !alignment.is_power_of_two() || alignment > PAGE_ALIGN {
            return Err(PoolError::InvalidAlignment { alignment });
        }

        let data = data_size.max(MIN_BLOCK_SIZE);
        let block_size = data
            .checked_next_multiple_of(alignment)
            .ok_or(PoolError::PageTooSmall { page_size, block_size: data })?;
        let first_block_offset = PAGE_HEADER_SIZE.next_multiple_of(alignment);
        let blocks_per_page = page_size.saturating_sub(first_block_offset) / block_size;
        if blocks_per_page == 0 {
            return Err(PoolError::PageTooSmall { page_size, block_size });
        }

        // Safety: forwarded caller contract.
        unsafe { self.free_all(pages) };

        self.block_size = block_size;
        self.alignment_size = block_size - data;
        self.page_size = page_size;
        self.blocks_per_page = blocks_per_page;
        self.first_block_offset = first_block_offset;
        Ok(())
    }

    /// Pop a block, growing the pool by exactly one page when the free list
    /// is empty. Never returns null; provider exhaustion is fatal.
    ///
    /// # Panics
    ///
    /// Panics if the pool was never configured with [`reset`](Self::reset).
    ///
    /// # Safety
    /// `pages` must be the live provider every page of this pool came from.
    /// A pool without pages may be handed any provider, which it is then
    /// bound to until [`free_all`](Self::free_all).
    #[inline]
    pub unsafe fn alloc<P: PageProvider>(&mut self, pages: &mut P) -> NonNull<u8> {
        let head = match self.free_list {
            Some(head) => head,
            None => self.grow(pages),
        };

        // Safety: head is a free block inside one of our pages; its header was
        // written when it was linked.
        let next = unsafe { head.as_ptr().read_unaligned().next };
        self.free_list = next;
        self.free_blocks -= 1;

        let block = head.cast::<u8>();
        #[cfg(debug_assertions)]
        self.debug_mark_live(block);
        // Safety: block spans block_size bytes inside our page.
        unsafe { fill::stamp(block, self.data_len(), fill::ALLOC_PATTERN) };
        block
    }

    /// [`alloc`](Self::alloc) for a caller that knows its size. `size` must
    /// fit in one block; checked in debug builds only.
    ///
    /// # Safety
    /// Same provider contract as [`alloc`](Self::alloc).
    #[inline]
    pub unsafe fn alloc_bytes<P: PageProvider>(&mut self, size: usize, pages: &mut P) -> NonNull<u8> {
        debug_assert!(
            size <= self.block_size,
            "requested {size} bytes from a {}-byte block pool",
            self.block_size
        );
        // Safety: forwarded caller contract.
        unsafe { self.alloc(pages) }
    }

    /// Push a block back onto the free list.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`alloc`](Self::alloc) or
    ///   [`alloc_bytes`](Self::alloc_bytes) on this pool since its last reset.
    /// - `ptr` must not have been freed already.
    ///
    /// Both are checked in debug builds only.
    #[inline]
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        #[cfg(debug_assertions)]
        self.debug_mark_free(ptr);

        // Safety: ptr is one of our blocks (caller contract) and spans
        // block_size bytes.
        unsafe {
            fill::stamp(ptr, self.data_len(), fill::FREE_PATTERN);
            ptr.cast::<BlockHeader>()
                .as_ptr()
                .write_unaligned(BlockHeader { next: self.free_list });
        }
        self.free_list = Some(ptr.cast());
        self.free_blocks += 1;
    }

    /// Return every page to `pages` and reset all counters to zero.
    /// Configuration is kept.
    ///
    /// # Safety
    /// If the pool holds pages, `pages` must be the live provider they came
    /// from. Blocks handed out by this pool dangle afterwards.
    pub unsafe fn free_all<P: PageProvider>(&mut self, pages: &mut P) {
        let released = self.pages;
        let mut cursor = self.page_list.take();
        while let Some(page) = cursor {
            // Safety: page is the start of a page we linked in `grow`.
            cursor = unsafe { page.as_ptr().read().next };
            // Safety: page came from this provider and is released exactly once.
            unsafe { pages.free_page(page.cast()) };
        }

        self.free_list = None;
        self.pages = 0;
        self.blocks = 0;
        self.free_blocks = 0;
        #[cfg(debug_assertions)]
        self.live_map.clear();

        if released > 0 {
            tracing::trace!(block_size = self.block_size, pages = released, "pool released pages");
        }
    }

    /// Request one page and thread all of its blocks into the free list.
    /// Returns the new free-list head.
    #[cold]
    fn grow<P: PageProvider>(&mut self, pages: &mut P) -> NonNull<BlockHeader> {
        assert!(
            self.blocks_per_page > 0,
            "BlockAllocator used before reset configured it"
        );
        debug_assert!(self.free_list.is_none());

        let page = pages.allocate_page(self.page_size, MemoryDomain::Pool);
        let header = page.cast::<PageHeader>();
        // Safety: page is PAGE_ALIGN-aligned and at least page_size bytes.
        unsafe { header.as_ptr().write(PageHeader { next: self.page_list }) };
        self.page_list = Some(header);

        let data_len = self.data_len();
        // Safety: first_block_offset + blocks_per_page * block_size <= page_size.
        let first = unsafe { page.add(self.first_block_offset) };
        for i in 0..self.blocks_per_page {
            // Safety: every offset computed here stays inside the page.
            unsafe {
                let block = first.add(i * self.block_size);
                fill::stamp_new_block(block, data_len, self.alignment_size);
                let next = if i + 1 < self.blocks_per_page {
                    Some(block.add(self.block_size).cast::<BlockHeader>())
                } else {
                    None
                };
                block
                    .cast::<BlockHeader>()
                    .as_ptr()
                    .write_unaligned(BlockHeader { next });
            }
        }

        let head = first.cast::<BlockHeader>();
        self.free_list = Some(head);
        self.pages += 1;
        self.blocks += self.blocks_per_page;
        self.free_blocks += self.blocks_per_page;

        #[cfg(debug_assertions)]
        self.live_map
            .insert(page.as_ptr() as usize, FixedBitSet::with_capacity(self.blocks_per_page));

        tracing::trace!(
            block_size = self.block_size,
            pages = self.pages,
            blocks = self.blocks,
            "pool grew by one page"
        );
        head
    }

    /// Bytes of a block not counting alignment padding.
    #[inline]
    fn data_len(&self) -> usize {
        self.block_size - self.alignment_size
    }

    /// Locate `ptr` as `(page address, slot)`, asserting it is a block
    /// boundary inside one of our pages.
    #[cfg(debug_assertions)]
    fn debug_locate(&self, ptr: NonNull<u8>) -> (usize, usize) {
        let addr = ptr.as_ptr() as usize;
        let span = self.blocks_per_page * self.block_size;
        // The only page that can hold addr is the highest one starting at or
        // below it.
        let found = self
            .live_map
            .range(..=addr)
            .next_back()
            .map(|(&page, _)| page)
            .filter(|&page| {
                let start = page + self.first_block_offset;
                addr >= start && addr < start + span
            });
        let Some(page) = found else {
            panic!("pointer {ptr:p} is not owned by this {}-byte pool", self.block_size);
        };
        let offset = addr - (page + self.first_block_offset);
        assert!(
            offset.is_multiple_of(self.block_size),
            "pointer {ptr:p} is not on a block boundary of this {}-byte pool",
            self.block_size
        );
        (page, offset / self.block_size)
    }

    #[cfg(debug_assertions)]
    fn debug_mark_live(&mut self, ptr: NonNull<u8>) {
        let (page, slot) = self.debug_locate(ptr);
        if let Some(live) = self.live_map.get_mut(&page) {
            assert!(!live.contains(slot), "free list handed out live block {ptr:p}");
            live.insert(slot);
        }
    }

    #[cfg(debug_assertions)]
    fn debug_mark_free(&mut self, ptr: NonNull<u8>) {
        let (page, slot) = self.debug_locate(ptr);
        if let Some(live) = self.live_map.get_mut(&page) {
            assert!(live.contains(slot), "double free of block {ptr:p}");
            live.set(slot, false);
        }
    }

    /// Aligned block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Alignment every block of this pool is guaranteed to have: the largest
    /// power of two dividing the page alignment, the first block offset and
    /// the block size.
    #[must_use]
    pub fn block_alignment(&self) -> usize {
        1 << (PAGE_ALIGN | self.first_block_offset | self.block_size).trailing_zeros()
    }

    /// Padding appended to each block to reach `block_size`.
    #[must_use]
    pub fn alignment_size(&self) -> usize {
        self.alignment_size
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn blocks_per_page(&self) -> usize {
        self.blocks_per_page
    }

    /// Pages currently in the chain.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Blocks across all pages, free or live.
    #[must_use]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Blocks currently handed out. `free_blocks + live_blocks == blocks`.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks - self.free_blocks
    }
}
