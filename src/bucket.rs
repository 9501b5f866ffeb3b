use std::{mem, ptr::NonNull};

use crate::{
    error::PoolError,
    platform::{request_memory, return_memory},
};

/// Length in bytes of the mapping that backs every [`Bucket`]. This is
/// exactly `2 * (2^16 - 1)`, the largest region that keeps `num_blocks`
/// representable as an unsigned 16 bit integer for any block size of at
/// least 2 bytes. With 16 bit indices the embedded free list costs 2 bytes
/// per free block instead of a full pointer, which matters when blocks are
/// as small as 2 bytes.
pub(crate) const BUCKET_BYTES: usize = 2 * u16::MAX as usize;

/// Embedded list nodes are 16 bit indices, so a block can never be smaller
/// than one node.
pub(crate) const MIN_BLOCK_SIZE: usize = mem::size_of::<u16>();

/// One OS mapped region partitioned into equal sized blocks. Unused blocks
/// are threaded through an embedded singly linked list of block indices, so
/// the bucket serves allocations and deallocations in constant time without
/// any bookkeeping outside the mapping itself:
///
/// ```text
///  data                                                data + BUCKET_BYTES
///   |                                                           |
///   v                                                           v
///   +---------+---------+---------+---------+--     --+---------+
///   |  used   |  free   |  used   |  free   |   ...   |  free   |
///   +---------+---------+---------+---------+--     --+---------+
///        ^         |                   ^                   |
///        |         +-------------------|-------------------+
///        |                             |                   |
///        |   first_unused_block -------+          sentinel +--> num_blocks
///        |
///        +--- the caller owns every byte of a used block
/// ```
///
/// Each free block stores the index of the next free block in its first
/// 2 byte aligned word; used blocks never have that word touched. The list
/// is LIFO: deallocated blocks become the new head and are handed out again
/// first, while their contents are still warm in cache.
pub(crate) struct Bucket {
    /// Base address of the mapping.
    data: NonNull<u8>,
    /// Effective bytes per block. Always at least [`MIN_BLOCK_SIZE`].
    block_size: u16,
    /// Total number of blocks, `BUCKET_BYTES / block_size`. Doubles as the
    /// sentinel index that terminates the free list.
    num_blocks: u16,
    /// Blocks currently handed out to callers.
    num_used_blocks: u16,
    /// Head of the embedded free list, equal to `num_blocks` when the
    /// bucket is full.
    first_unused_block: u16,
}

// The mapping is owned exclusively through `data`, so sending a bucket to
// another thread just transfers that ownership.
unsafe impl Send for Bucket {}

impl Bucket {
    /// Maps a new region and threads all of its blocks through the free
    /// list. Block sizes smaller than [`MIN_BLOCK_SIZE`] are clamped, the
    /// embedded list node has to fit in the block.
    pub fn init(block_size: usize) -> Result<Self, PoolError> {
        let block_size = block_size.max(MIN_BLOCK_SIZE) as u16;

        let Some(data) = (unsafe { request_memory(BUCKET_BYTES) }) else {
            return Err(PoolError::MapFailed(BUCKET_BYTES));
        };

        let num_blocks = (BUCKET_BYTES / block_size as usize) as u16;

        let bucket = Self {
            data,
            block_size,
            num_blocks,
            num_used_blocks: 0,
            first_unused_block: 0,
        };

        // Block i points to block i + 1, the last block stores the sentinel.
        for i in 0..num_blocks {
            unsafe { bucket.node(i).write(i + 1) };
        }

        Ok(bucket)
    }

    /// Pointer to the embedded list node of `block_index`. The node lives at
    /// the first 2 byte aligned address of the block: the mapping itself is
    /// page aligned, so blocks at even offsets store it at their base and
    /// blocks at odd offsets (odd block sizes produce those) one byte in.
    ///
    /// ```text
    ///    block at even offset            block at odd offset
    ///   +---------+---------+          +-----+---------+------+
    ///   |  next   |   ...   |          | pad |  next   | ...  |
    ///   +---------+---------+          +-----+---------+------+
    ///    ^                                    ^
    ///    +--- node                            +--- node
    /// ```
    ///
    /// Whether the block is used or unused is not checked here. The node of
    /// a used block belongs to the caller and must not be touched.
    ///
    /// # Safety
    ///
    /// `block_index` must be less than `num_blocks`.
    unsafe fn node(&self, block_index: u16) -> *mut u16 {
        let p = self
            .data
            .as_ptr()
            .add(block_index as usize * self.block_size as usize);

        // Pointer to the node must be aligned to u16.
        let p = if p as usize % 2 == 0 { p } else { p.add(1) };

        p.cast()
    }

    /// Unlinks the head of the free list and hands it out. Infallible, the
    /// mapping already exists.
    ///
    /// # Safety
    ///
    /// The bucket must not be full. Calling this on a full bucket would
    /// treat the sentinel as a block index past the end of the mapping.
    pub unsafe fn allocate(&mut self) -> NonNull<u8> {
        debug_assert!(!self.is_full());

        let block_index = self.first_unused_block;

        self.first_unused_block = *self.node(block_index);
        self.num_used_blocks += 1;

        NonNull::new_unchecked(
            self.data
                .as_ptr()
                .add(block_index as usize * self.block_size as usize),
        )
    }

    /// Links the block at `address` back in as the new head of the free
    /// list.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Bucket::allocate`] on this
    /// same bucket and must not have been deallocated since. Double frees
    /// are only detected by the `extra-checks` feature in debug builds.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        debug_assert!(self.contains(address));

        let offset = address.as_ptr() as usize - self.data.as_ptr() as usize;

        // Pointers we hand out always sit on a block boundary.
        debug_assert_eq!(offset % self.block_size as usize, 0);

        let block_index = (offset / self.block_size as usize) as u16;

        #[cfg(feature = "extra-checks")]
        self.assert_not_free(block_index);

        *self.node(block_index) = self.first_unused_block;
        self.first_unused_block = block_index;
        self.num_used_blocks -= 1;
    }

    /// Walks the entire free list checking that `block_index` is not on it.
    /// O(`num_blocks`) on every deallocation, hence feature gated and
    /// compiled out of release builds.
    #[cfg(feature = "extra-checks")]
    unsafe fn assert_not_free(&self, block_index: u16) {
        if cfg!(debug_assertions) {
            let mut current = self.first_unused_block;
            while current != self.num_blocks {
                assert_ne!(current, block_index, "double free of block {block_index}");
                current = *self.node(current);
            }
        }
    }

    /// Whether no block is currently handed out.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_used_blocks == 0
    }

    /// Whether every block is currently handed out.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_used_blocks == self.num_blocks
    }

    /// Whether `address` points into this bucket's mapping.
    #[inline]
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        let base = self.data.as_ptr() as usize;
        let address = address.as_ptr() as usize;

        base <= address && address < base + BUCKET_BYTES
    }

    #[cfg(test)]
    pub fn num_blocks(&self) -> u16 {
        self.num_blocks
    }

    /// Number of nodes on the free list. Only used to verify the free list
    /// invariant in tests, a correct bucket never needs to count.
    #[cfg(test)]
    pub fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut current = self.first_unused_block;

        while current != self.num_blocks {
            len += 1;
            current = unsafe { *self.node(current) };
        }

        len
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // Dropping a bucket with live blocks would leave callers with
        // dangling pointers into an unmapped region.
        debug_assert!(self.is_empty());

        unsafe { return_memory(self.data, BUCKET_BYTES) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_threads_every_block_through_the_free_list() {
        let bucket = Bucket::init(8).unwrap();

        assert_eq!(bucket.num_blocks() as usize, BUCKET_BYTES / 8);
        assert!(bucket.is_empty());
        assert!(!bucket.is_full());
        assert_eq!(bucket.free_list_len(), bucket.num_blocks() as usize);
    }

    #[test]
    fn block_size_is_clamped_to_hold_a_node() {
        let bucket = Bucket::init(1).unwrap();

        // A 1 byte block cannot store a 16 bit index.
        assert_eq!(bucket.num_blocks() as usize, BUCKET_BYTES / 2);
    }

    #[test]
    fn allocations_walk_the_bucket_front_to_back() {
        let mut bucket = Bucket::init(16).unwrap();

        unsafe {
            let first = bucket.allocate();
            let second = bucket.allocate();
            let third = bucket.allocate();

            // Freshly initialized free list is ordered by index.
            assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 16);
            assert_eq!(third.as_ptr() as usize - second.as_ptr() as usize, 16);

            assert_eq!(bucket.free_list_len(), bucket.num_blocks() as usize - 3);

            bucket.deallocate(first);
            bucket.deallocate(second);
            bucket.deallocate(third);
        }

        assert!(bucket.is_empty());
    }

    #[test]
    fn deallocated_block_is_handed_out_first() {
        let mut bucket = Bucket::init(4).unwrap();

        unsafe {
            let first = bucket.allocate();
            let second = bucket.allocate();

            bucket.deallocate(first);

            // LIFO, the freed block becomes the head of the list.
            assert_eq!(bucket.allocate(), first);

            bucket.deallocate(first);
            bucket.deallocate(second);
        }
    }

    #[test]
    fn odd_block_sizes_keep_nodes_reachable() {
        // Blocks of 3 bytes start at odd offsets every other block, which
        // exercises the base + 1 node placement.
        let mut bucket = Bucket::init(3).unwrap();

        unsafe {
            let mut addresses = Vec::new();

            for _ in 0..100 {
                addresses.push(bucket.allocate());
            }

            assert_eq!(bucket.free_list_len(), bucket.num_blocks() as usize - 100);

            for address in addresses {
                bucket.deallocate(address);
            }
        }

        assert!(bucket.is_empty());
        assert_eq!(bucket.free_list_len(), bucket.num_blocks() as usize);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // 65535 iterations is too slow interpreted
    fn filling_the_bucket_exactly_reaches_the_sentinel() {
        let mut bucket = Bucket::init(2).unwrap();

        assert_eq!(bucket.num_blocks(), u16::MAX);

        unsafe {
            let mut addresses = Vec::with_capacity(u16::MAX as usize);

            for _ in 0..u16::MAX {
                addresses.push(bucket.allocate().as_ptr() as usize);
            }

            assert!(bucket.is_full());
            assert_eq!(bucket.free_list_len(), 0);

            let base = addresses[0];
            for address in &addresses {
                assert!(*address >= base && *address < base + BUCKET_BYTES);
                assert_eq!(*address % 2, 0);
            }

            // No block was handed out twice.
            addresses.sort_unstable();
            addresses.dedup();
            assert_eq!(addresses.len(), u16::MAX as usize);

            for address in addresses {
                bucket.deallocate(NonNull::new(address as *mut u8).unwrap());
            }
        }

        assert!(bucket.is_empty());
    }

    #[test]
    fn contains_covers_the_whole_mapping() {
        let mut bucket = Bucket::init(32).unwrap();

        unsafe {
            let address = bucket.allocate();

            assert!(bucket.contains(address));
            assert!(bucket.contains(NonNull::new_unchecked(
                address.as_ptr().add(BUCKET_BYTES - 32)
            )));
            assert!(!bucket.contains(NonNull::new_unchecked(
                address.as_ptr().add(BUCKET_BYTES)
            )));

            bucket.deallocate(address);
        }
    }

    #[test]
    #[cfg(feature = "extra-checks")]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught_by_extra_checks() {
        let mut bucket = Bucket::init(8).unwrap();

        unsafe {
            let address = bucket.allocate();
            bucket.deallocate(address);
            bucket.deallocate(address);
        }
    }
}
