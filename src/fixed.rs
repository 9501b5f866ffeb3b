use std::ptr::NonNull;

use log::trace;

use crate::{bucket::Bucket, error::PoolError, AllocResult};

/// A growable collection of [`Bucket`]s that all serve one block size. New
/// buckets are mapped on demand when every existing bucket is full, and
/// emptied buckets are returned to the kernel, except for one spare that is
/// kept parked at the tail of the table:
///
/// ```text
///                 buckets[0]    buckets[1]    buckets[2]    buckets[3]
///                +-----------+ +-----------+ +-----------+ +-----------+
///                |   full    | |  partial  | |   full    | |   empty   |
///                +-----------+ +-----------+ +-----------+ +-----------+
///                                    ^                           ^
///                                    |                           |
///                               last_alloc                  last_empty
/// ```
///
/// Workloads that keep allocating and freeing the same handful of blocks
/// would otherwise tear a bucket down on the last free just to map a new
/// one on the next allocation; the spare absorbs that churn. Keeping the
/// spare at the tail makes releasing the previous spare a plain pop.
///
/// The three caches remember which bucket served the last allocation and
/// deallocation so that steady workloads skip the linear bucket scan. They
/// are indices instead of raw pointers, so a table append that reallocates
/// the `Vec` cannot leave them dangling; they are still refreshed on every
/// table mutation, exactly like pointers would have to be.
pub(crate) struct FixedSizeAllocator {
    /// Block size served by this allocator, in bytes. [`Bucket::init`]
    /// clamps sizes that cannot hold an embedded list node.
    block_size: usize,
    /// Every bucket mapped for this block size. Creation order, except that
    /// empty bucket reclamation swaps the spare to the tail.
    buckets: Vec<Bucket>,
    /// Bucket that served the last allocation.
    last_alloc: Option<usize>,
    /// Bucket that served the last deallocation.
    last_dealloc: Option<usize>,
    /// The spare bucket. `None` or the last element of `buckets`, and the
    /// only empty bucket in the table either way.
    last_empty: Option<usize>,
}

impl FixedSizeAllocator {
    /// No mapping happens until the first allocation.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            buckets: Vec::new(),
            last_alloc: None,
            last_dealloc: None,
            last_empty: None,
        }
    }

    /// Returns a block of `block_size` bytes.
    pub fn allocate(&mut self) -> AllocResult {
        let index = match self.last_alloc {
            Some(index) if !self.buckets[index].is_full() => index,
            _ => self.find_or_grow()?,
        };

        self.last_alloc = Some(index);

        // This bucket is about to stop being empty, it can no longer serve
        // as the spare.
        if self.last_alloc == self.last_empty {
            self.last_empty = None;
        }

        // The chosen bucket is never full.
        Ok(unsafe { self.buckets[index].allocate() })
    }

    /// Scans the table left to right for the first bucket with a free block
    /// and falls back to mapping a new one.
    fn find_or_grow(&mut self) -> Result<usize, PoolError> {
        if let Some(index) = self.buckets.iter().position(|bucket| !bucket.is_full()) {
            return Ok(index);
        }

        // Nothing observable happens until both fallible steps have
        // succeeded: a bucket that cannot be appended returns its mapping
        // to the kernel when it drops, and a failed reserve leaves the
        // table untouched.
        let bucket = Bucket::init(self.block_size)?;
        self.buckets.try_reserve(1)?;
        self.buckets.push(bucket);

        // A grown table starts with fresh caches.
        self.last_dealloc = None;
        self.last_empty = None;

        trace!(
            "block size {}: mapped bucket number {}",
            self.block_size,
            self.buckets.len()
        );

        Ok(self.buckets.len() - 1)
    }

    /// Returns the block at `address` to its bucket.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`FixedSizeAllocator::allocate`]
    /// on this same instance and must not have been deallocated since.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        let index = match self.last_dealloc {
            Some(index) if self.buckets[index].contains(address) => index,
            _ => self
                .buckets
                .iter()
                .position(|bucket| bucket.contains(address))
                .expect("pointer does not belong to this size class"),
        };

        self.last_dealloc = Some(index);

        self.buckets[index].deallocate(address);

        if self.buckets[index].is_empty() {
            self.reclaim(index);
        }
    }

    /// Empty bucket reclamation. The bucket at `index` just ran out of used
    /// blocks: it becomes the new spare at the tail of the table, and the
    /// mapping of the previous spare, if there was one, goes back to the
    /// kernel. Deallocation is the only trigger, allocation never releases
    /// anything.
    fn reclaim(&mut self, index: usize) {
        if let Some(last_empty) = self.last_empty {
            // The spare lives at the tail, so releasing it is O(1). It
            // cannot be the bucket that just became empty, that one still
            // contained a block a moment ago.
            debug_assert_eq!(last_empty, self.buckets.len() - 1);
            debug_assert_ne!(last_empty, index);

            self.buckets.pop();

            trace!("block size {}: released spare bucket", self.block_size);
        }

        let tail = self.buckets.len() - 1;
        self.buckets.swap(index, tail);

        self.last_alloc = None;
        self.last_dealloc = Some(tail);
        self.last_empty = Some(tail);
    }

    #[cfg(test)]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Checks the spare bucket invariant: at most one empty bucket, and if
    /// one exists it is the tail and the tracked spare.
    #[cfg(test)]
    pub fn check_spare_invariant(&self) {
        let empty: Vec<usize> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.is_empty())
            .map(|(index, _)| index)
            .collect();

        match self.last_empty {
            None => assert!(empty.is_empty()),
            Some(index) => {
                assert_eq!(empty, [index]);
                assert_eq!(index, self.buckets.len() - 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BUCKET_BYTES;

    #[test]
    fn first_allocation_maps_one_bucket() {
        let mut fixed = FixedSizeAllocator::new(8);

        assert_eq!(fixed.buckets().len(), 0);

        let address = fixed.allocate().unwrap();

        assert_eq!(fixed.buckets().len(), 1);
        assert!(fixed.buckets()[0].contains(address));

        unsafe { fixed.deallocate(address) };

        // The emptied bucket is kept as the spare instead of being torn
        // down right away.
        assert_eq!(fixed.buckets().len(), 1);
        fixed.check_spare_invariant();
    }

    #[test]
    fn freed_block_is_reused_before_fresh_ones() {
        let mut fixed = FixedSizeAllocator::new(4);

        unsafe {
            let first = fixed.allocate().unwrap();
            let second = fixed.allocate().unwrap();

            fixed.deallocate(first);

            assert_eq!(fixed.allocate().unwrap(), first);

            fixed.deallocate(first);
            fixed.deallocate(second);
        }

        fixed.check_spare_invariant();
    }

    #[test]
    fn allocate_free_churn_reuses_the_spare() {
        let mut fixed = FixedSizeAllocator::new(16);

        // Alternating a last allocation with its deallocation must not
        // bounce mappings back and forth to the kernel.
        for _ in 0..100 {
            let address = fixed.allocate().unwrap();
            assert_eq!(fixed.buckets().len(), 1);
            unsafe { fixed.deallocate(address) };
            assert_eq!(fixed.buckets().len(), 1);
        }

        fixed.check_spare_invariant();
    }

    #[test]
    #[cfg_attr(miri, ignore)] // fills whole buckets, too slow interpreted
    fn overflowing_a_full_bucket_maps_a_second_one() {
        let mut fixed = FixedSizeAllocator::new(2);

        let num_blocks = BUCKET_BYTES / 2;
        let mut addresses = Vec::with_capacity(num_blocks + 1);

        for _ in 0..num_blocks {
            addresses.push(fixed.allocate().unwrap());
        }

        assert_eq!(fixed.buckets().len(), 1);
        assert!(fixed.buckets()[0].is_full());

        // One more than the bucket can hold.
        addresses.push(fixed.allocate().unwrap());
        assert_eq!(fixed.buckets().len(), 2);

        unsafe {
            for address in addresses {
                fixed.deallocate(address);
            }
        }

        // Quiescent again: a single spare bucket remains.
        assert_eq!(fixed.buckets().len(), 1);
        fixed.check_spare_invariant();
    }

    #[test]
    #[cfg_attr(miri, ignore)] // fills whole buckets, too slow interpreted
    fn emptied_bucket_is_swapped_to_the_tail_and_spares_collapse() {
        let mut fixed = FixedSizeAllocator::new(8);

        let num_blocks = BUCKET_BYTES / 8;

        // Fill bucket A completely, then overflow into bucket B.
        let mut in_a = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            in_a.push(fixed.allocate().unwrap());
        }
        let in_b = fixed.allocate().unwrap();

        assert_eq!(fixed.buckets().len(), 2);
        assert!(!fixed.buckets()[0].contains(in_b));

        // Free all of A. Both buckets stay mapped, A parks at the tail as
        // the spare while B still holds one block.
        unsafe {
            for address in in_a {
                fixed.deallocate(address);
            }
        }

        assert_eq!(fixed.buckets().len(), 2);
        fixed.check_spare_invariant();

        // Freeing the last block of B makes B the new spare and releases A.
        unsafe { fixed.deallocate(in_b) };

        assert_eq!(fixed.buckets().len(), 1);
        assert!(fixed.buckets()[0].contains(in_b));
        fixed.check_spare_invariant();
    }

    #[test]
    fn spare_is_consumed_by_the_next_allocation() {
        let mut fixed = FixedSizeAllocator::new(32);

        let first = fixed.allocate().unwrap();
        unsafe { fixed.deallocate(first) };
        fixed.check_spare_invariant();

        // The spare is non full, so the scan picks it up again.
        let second = fixed.allocate().unwrap();
        assert_eq!(fixed.buckets().len(), 1);

        // Not empty anymore, it cannot be the spare.
        assert!(!fixed.buckets()[0].is_empty());

        unsafe { fixed.deallocate(second) };
        fixed.check_spare_invariant();
    }

    #[test]
    fn free_list_stays_consistent_across_mixed_traffic() {
        let mut fixed = FixedSizeAllocator::new(24);

        let mut live = Vec::new();

        for round in 0..50 {
            for _ in 0..10 {
                live.push(fixed.allocate().unwrap());
            }

            // Free every other block to shuffle the embedded lists.
            let mut index = 0;
            live.retain(|address| {
                index += 1;
                if index % 2 == round % 2 {
                    unsafe { fixed.deallocate(*address) };
                    false
                } else {
                    true
                }
            });

            for bucket in fixed.buckets() {
                let free = bucket.free_list_len();
                let total = bucket.num_blocks() as usize;
                assert!(free <= total);
            }
        }

        unsafe {
            for address in live {
                fixed.deallocate(address);
            }
        }

        // Everything returned: one spare bucket, fully free.
        assert_eq!(fixed.buckets().len(), 1);
        let bucket = &fixed.buckets()[0];
        assert_eq!(bucket.free_list_len(), bucket.num_blocks() as usize);
        fixed.check_spare_invariant();
    }
}
