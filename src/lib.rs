#[cfg(not(target_pointer_width = "64"))]
compile_error!("poolmem supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// pools
pub use memory::block::BlockAllocator;
pub use memory::pages::{HeapPages, MemoryDomain, PAGE_ALIGN, PageProvider, PageRecord};
pub use memory::size_class::{DEFAULT_TIERS, SizeClassTable, SizeClassTier};

// mgmt/stats
pub use memory::manager::{LeakReport, MemoryManager, MemoryManagerConfig, MemoryStats, PoolStats};
pub use memory::stats::{ByteGauge, LARGE_BYTES_LIVE, PAGE_BYTES_TRACKED, POOL_PAGES_COMMITTED};

// adapters
pub use memory::adapter::{Allocator, Mallocator, StdAllocator};

// debug patterns
pub use memory::fill::{ALIGN_PATTERN, ALLOC_PATTERN, FREE_PATTERN};

// errors
pub use memory::error::PoolError;
