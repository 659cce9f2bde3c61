//! Allocator handles for generic containers.
//!
//! [`Allocator`] draws element storage from a [`MemoryManager`];
//! [`Mallocator`] goes straight to the C heap. Both implement
//! [`StdAllocator`], so a container written against the trait can switch
//! backends by changing one type parameter.

use super::manager::MemoryManager;
use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// Typed allocation interface for containers.
///
/// Storage for `n` elements is requested and returned as a unit;
/// `deallocate` must be called with the same `n` that `allocate` was given.
pub trait StdAllocator<T>: Clone {
    /// The same allocator, retargeted at elements of type `U`.
    type Rebind<U>: StdAllocator<U>;

    /// Uninitialized storage for `n` elements. `n == 0` or a zero-sized `T`
    /// yields a dangling, well-aligned pointer without touching the heap.
    ///
    /// # Panics
    ///
    /// Panics if `n * size_of::<T>()` overflows `isize`.
    fn allocate(&self, n: usize) -> NonNull<T>;

    /// Return storage from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `p` must come from `allocate(n)` on an allocator equal to this one.
    /// - `n` must be the count passed to that call.
    /// - Any elements still in the storage are not dropped.
    unsafe fn deallocate(&self, p: NonNull<T>, n: usize);

    /// Largest `n` that `allocate` can accept.
    fn max_size(&self) -> usize {
        match size_of::<T>() {
            0 => usize::MAX,
            size => (isize::MAX as usize) / size,
        }
    }

    /// Move `value` into the uninitialized slot at `p`.
    ///
    /// # Safety
    /// `p` must be valid for writes and properly aligned.
    unsafe fn construct(&self, p: NonNull<T>, value: T) {
        // Safety: forwarded caller contract.
        unsafe { p.as_ptr().write(value) };
    }

    /// Drop the value at `p` in place, leaving the slot uninitialized.
    ///
    /// # Safety
    /// `p` must point to an initialized `T` that is not used afterwards.
    unsafe fn destroy(&self, p: NonNull<T>) {
        // Safety: forwarded caller contract.
        unsafe { p.as_ptr().drop_in_place() };
    }

    fn rebind<U>(&self) -> Self::Rebind<U>;
}

#[inline]
fn array_layout<T>(n: usize) -> Layout {
    Layout::array::<T>(n).unwrap_or_else(|_| panic!("capacity overflow"))
}

#[inline]
fn dangling<T>() -> NonNull<T> {
    NonNull::dangling()
}

/// Allocator backed by a [`MemoryManager`].
///
/// Holds a shared reference to the manager, so the manager must outlive every
/// container using it. Two handles are equal when they are bound to the same
/// manager, whatever their element types.
///
/// Each call borrows the manager mutably for its duration; calling through a
/// handle while the manager is already borrowed panics.
pub struct Allocator<'a, T> {
    manager: &'a RefCell<MemoryManager>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> Allocator<'a, T> {
    #[must_use]
    pub fn new(manager: &'a RefCell<MemoryManager>) -> Self {
        Self { manager, _marker: PhantomData }
    }

    #[must_use]
    pub fn manager(&self) -> &'a RefCell<MemoryManager> {
        self.manager
    }
}

impl<T> Clone for Allocator<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Allocator<'_, T> {}

impl<T> fmt::Debug for Allocator<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("manager", &(self.manager as *const RefCell<MemoryManager>))
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<'b, T, U> PartialEq<Allocator<'b, U>> for Allocator<'_, T> {
    fn eq(&self, other: &Allocator<'b, U>) -> bool {
        std::ptr::eq(self.manager, other.manager)
    }
}

impl<T> Eq for Allocator<'_, T> {}

impl<'a, T> StdAllocator<T> for Allocator<'a, T> {
    type Rebind<U> = Allocator<'a, U>;

    /// # Panics
    ///
    /// Also panics if the manager is not initialized or already borrowed.
    fn allocate(&self, n: usize) -> NonNull<T> {
        let layout = array_layout::<T>(n);
        if layout.size() == 0 {
            return dangling();
        }
        self.manager.borrow_mut().allocate_layout(layout).cast()
    }

    unsafe fn deallocate(&self, p: NonNull<T>, n: usize) {
        let layout = array_layout::<T>(n);
        if layout.size() == 0 {
            return;
        }
        // Safety: forwarded caller contract; the layout is recomputed
        // exactly as in allocate.
        unsafe { self.manager.borrow_mut().free_layout(p.cast(), layout) };
    }

    fn rebind<U>(&self) -> Allocator<'a, U> {
        Allocator::new(self.manager)
    }
}

/// Allocator backed directly by `malloc`/`free`. Stateless; every instance
/// is equal to every other.
pub struct Mallocator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Mallocator<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for Mallocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Mallocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Mallocator<T> {}

impl<T> fmt::Debug for Mallocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mallocator")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T, U> PartialEq<Mallocator<U>> for Mallocator<T> {
    fn eq(&self, _other: &Mallocator<U>) -> bool {
        true
    }
}

impl<T> Eq for Mallocator<T> {}

/// Alignment `malloc` guarantees on the supported 64-bit targets.
const MALLOC_ALIGN: usize = 2 * size_of::<usize>();

impl<T> StdAllocator<T> for Mallocator<T> {
    type Rebind<U> = Mallocator<U>;

    fn allocate(&self, n: usize) -> NonNull<T> {
        let layout = array_layout::<T>(n);
        if layout.size() == 0 {
            return dangling();
        }

        let raw = if align_of::<T>() <= MALLOC_ALIGN {
            // Safety: non-zero size.
            unsafe { libc::malloc(layout.size()) }
        } else {
            aligned_malloc(layout)
        };
        match NonNull::new(raw.cast::<T>()) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(layout),
        }
    }

    unsafe fn deallocate(&self, p: NonNull<T>, n: usize) {
        if array_layout::<T>(n).size() == 0 {
            return;
        }
        // Safety: p came from malloc or posix_memalign, both released by free.
        unsafe { libc::free(p.as_ptr().cast()) };
    }

    fn rebind<U>(&self) -> Mallocator<U> {
        Mallocator::new()
    }
}

#[cfg(unix)]
fn aligned_malloc(layout: Layout) -> *mut libc::c_void {
    let mut out = std::ptr::null_mut();
    // Safety: align is a power of two above MALLOC_ALIGN, so a multiple of
    // the pointer size as posix_memalign requires.
    let rc = unsafe { libc::posix_memalign(&mut out, layout.align(), layout.size()) };
    if rc == 0 { out } else { std::ptr::null_mut() }
}

#[cfg(not(unix))]
fn aligned_malloc(layout: Layout) -> *mut libc::c_void {
    panic!(
        "Mallocator cannot serve {}-byte alignment on this platform",
        layout.align()
    )
}
