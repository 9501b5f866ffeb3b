use std::{
    alloc::{GlobalAlloc, Layout, System},
    array, mem,
    ptr::NonNull,
    sync::{Mutex, OnceLock},
};

use crate::{error::PoolError, fixed::FixedSizeAllocator, AllocResult};

/// This is the main allocator, a fixed array of [`FixedSizeAllocator`]
/// dispatched by request size. There is one size class per byte, so a
/// request is never padded and no byte of a block is wasted on internal
/// fragmentation:
///
/// ```text
///                                    +--------+    +--------+    +--------+
/// allocators[0]   (1 byte blocks)    | bucket | -> | bucket | -> | bucket |
///                                    +--------+    +--------+    +--------+
///
///                                    +--------+    +--------+
/// allocators[1]   (2 byte blocks)    | bucket | -> | bucket |
///                                    +--------+    +--------+
///
/// ............................................................ . . .
///
///                                    +--------+
/// allocators[N-1] (N byte blocks)    | bucket |
///                                    +--------+
///
/// larger than N  ------------------>  system allocator
/// ```
///
/// Requests above `MAX_BLOCK_SIZE` are assumed to be rare enough in the
/// targeted workloads (containers of containers holding a handful of small
/// elements each) that the bucket machinery would be counterproductive, so
/// they go straight to the system allocator.
///
/// This struct needs mutable borrows to operate and is not thread safe, so
/// it has to be wrapped in a [`Mutex`]. See [`Poolloc`] for the public API.
struct InternalAllocator<const MAX_BLOCK_SIZE: usize> {
    /// `allocators[index]` serves blocks of exactly `index + 1` bytes.
    allocators: [FixedSizeAllocator; MAX_BLOCK_SIZE],
}

impl<const MAX_BLOCK_SIZE: usize> InternalAllocator<MAX_BLOCK_SIZE> {
    pub fn new() -> Self {
        Self {
            allocators: array::from_fn(|index| FixedSizeAllocator::new(index + 1)),
        }
    }

    /// Returns an address where `size` bytes can be safely written.
    pub fn allocate(&mut self, size: usize) -> AllocResult {
        assert!(size > 0, "zero size pool allocation");

        if size > MAX_BLOCK_SIZE {
            oversize::allocate(size)
        } else {
            self.allocators[size - 1].allocate()
        }
    }

    /// Deallocates the block at `address`.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by a call to
    /// [`InternalAllocator::allocate`] with the same `size` on this same
    /// instance and must not have been deallocated since.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>, size: usize) {
        assert!(size > 0, "zero size pool deallocation");

        if size > MAX_BLOCK_SIZE {
            oversize::deallocate(address, size);
        } else {
            self.allocators[size - 1].deallocate(address);
        }
    }
}

/// Passthrough to the system allocator for requests that don't fit any size
/// class. No pool state is involved at all.
mod oversize {
    use super::*;

    /// The layout has to be identical on both sides of the round trip. Word
    /// alignment comfortably covers the 2 byte guarantee of the pool path.
    fn layout_for(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, mem::align_of::<usize>()).ok()
    }

    pub(super) fn allocate(size: usize) -> AllocResult {
        let Some(layout) = layout_for(size) else {
            // Rounding `size` up to the alignment overflowed `isize`. No
            // allocator can satisfy such a request.
            return Err(PoolError::SystemAllocFailed(size));
        };

        match NonNull::new(unsafe { System.alloc(layout) }) {
            Some(address) => Ok(address),
            None => Err(PoolError::SystemAllocFailed(size)),
        }
    }

    pub(super) unsafe fn deallocate(address: NonNull<u8>, size: usize) {
        let Some(layout) = layout_for(size) else {
            // `allocate` never handed out an address for this size.
            return;
        };

        System.dealloc(address.as_ptr(), layout);
    }
}

/// Segregated fixed size block pool allocator.
///
/// Serves requests of 1 to `MAX_BLOCK_SIZE` bytes from per-size pools of OS
/// mapped buckets and anything larger from the system allocator. Designed
/// for workloads that churn through very large numbers of small allocations,
/// where general purpose allocators pay for headers and free list traversal
/// on every one of them.
///
/// All operations are internally synchronized by a single mutex, so a
/// `Poolloc` can be shared freely between threads. Most callers want the
/// process wide instance:
///
/// ```rust
/// use poolloc::Poolloc;
///
/// let pool = Poolloc::global();
///
/// let address = pool.allocate(24).unwrap();
///
/// unsafe {
///     address.as_ptr().write_bytes(0xAB, 24);
///     pool.deallocate(address, 24);
/// }
/// ```
///
/// A separate pool with its own size classes and its own lock can be built
/// with [`Poolloc::new`]:
///
/// ```rust
/// use poolloc::Poolloc;
///
/// // Everything above 64 bytes goes to the system allocator.
/// let pool = Poolloc::<64>::new();
///
/// let small = pool.allocate(64).unwrap();
/// let large = pool.allocate(4096).unwrap();
///
/// unsafe {
///     pool.deallocate(small, 64);
///     pool.deallocate(large, 4096);
/// }
/// ```
pub struct Poolloc<const MAX_BLOCK_SIZE: usize = 128> {
    /// One global [`Mutex`] over the whole dispatch. Per size class locks or
    /// per thread arenas would reduce contention, but they also need escape
    /// hatches for blocks freed on a different thread than they were
    /// allocated on; this allocator keeps the single shared instance model.
    allocator: Mutex<InternalAllocator<MAX_BLOCK_SIZE>>,
}

impl Poolloc {
    /// Returns the process wide pool, creating it on first use. Every
    /// caller in the process shares this instance and its 128 size classes.
    ///
    /// The instance is never destroyed. Bucket mappings still alive when
    /// the process exits are reclaimed by the kernel, so holding pool
    /// blocks inside objects that are dropped late (or never) is fine.
    pub fn global() -> &'static Poolloc {
        static GLOBAL: OnceLock<Poolloc> = OnceLock::new();

        GLOBAL.get_or_init(Poolloc::new)
    }
}

impl<const MAX_BLOCK_SIZE: usize> Poolloc<MAX_BLOCK_SIZE> {
    /// Builds a new pool. No memory is mapped until the first allocation.
    pub fn new() -> Self {
        Self {
            allocator: Mutex::new(InternalAllocator::new()),
        }
    }

    /// Returns a pointer to `size` uninitialized bytes, or an out of memory
    /// error if the kernel refuses to grow the pool. The pointer stays
    /// valid until it is passed to [`Poolloc::deallocate`].
    ///
    /// Blocks of even sizes (and size 1, which is served from 2 byte
    /// blocks) are 2 byte aligned. Blocks of odd sizes are only byte
    /// aligned; callers storing types with stricter alignment must pick a
    /// compatible size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn allocate(&self, size: usize) -> AllocResult {
        self.lock().allocate(size)
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by a call to [`Poolloc::allocate`]
    /// with the same `size` on this same pool and must not have been
    /// deallocated since.
    pub unsafe fn deallocate(&self, address: NonNull<u8>, size: usize) {
        self.lock().deallocate(address, size)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InternalAllocator<MAX_BLOCK_SIZE>> {
        // Every mutation runs after the last point that can panic, so a
        // poisoned lock still guards a consistent allocator.
        match self.allocator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Poolloc {
    fn default() -> Self {
        Poolloc::new()
    }
}
