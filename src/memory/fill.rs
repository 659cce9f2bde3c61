//! Diagnostic byte patterns for pool memory.
//!
//! Stamping is compiled in when debug assertions are on or the `fill-patterns`
//! feature is enabled; otherwise every function here is an empty inline call.
//! Patterns are written before free-list links, so the bytes a pool reads
//! back for its own bookkeeping are never the pattern.

use std::ptr::NonNull;

/// Data bytes of a block sitting on the free list.
pub const FREE_PATTERN: u8 = 0xDD;
/// Data bytes of a block handed out by `allocate`.
pub const ALLOC_PATTERN: u8 = 0xCD;
/// Padding between the requested data size and the aligned block size.
pub const ALIGN_PATTERN: u8 = 0xAA;

#[inline]
#[must_use]
pub const fn enabled() -> bool {
    cfg!(any(debug_assertions, feature = "fill-patterns"))
}

/// Stamp a freshly created block: `data_size` bytes of `FREE_PATTERN`
/// followed by `padding` bytes of `ALIGN_PATTERN`.
///
/// # Safety
/// `block` must be valid for writes of `data_size + padding` bytes.
#[inline]
pub unsafe fn stamp_new_block(block: NonNull<u8>, data_size: usize, padding: usize) {
    if enabled() {
        // Safety: caller guarantees the range is writable.
        unsafe {
            std::ptr::write_bytes(block.as_ptr(), FREE_PATTERN, data_size);
            std::ptr::write_bytes(block.as_ptr().add(data_size), ALIGN_PATTERN, padding);
        }
    }
}

/// Stamp the data region of a block with `pattern`.
///
/// # Safety
/// `block` must be valid for writes of `data_size` bytes.
#[inline]
pub unsafe fn stamp(block: NonNull<u8>, data_size: usize, pattern: u8) {
    if enabled() {
        // Safety: caller guarantees the range is writable.
        unsafe { std::ptr::write_bytes(block.as_ptr(), pattern, data_size) };
    }
}
