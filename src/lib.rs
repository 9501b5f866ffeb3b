//! Segregated fixed size block pool allocator.
//!
//! General purpose allocators pay a real price per allocation: headers,
//! free list traversal, fragmentation bookkeeping. Workloads that create
//! millions of tiny objects, like containers of containers where each inner
//! container holds a handful of elements, spend a surprising amount of time
//! and memory on that overhead. This crate trades generality for a pool
//! tuned to exactly that pattern.
//!
//! The allocator is built from three layers:
//!
//! * `bucket`: one OS mapped region partitioned into equal sized blocks,
//!   linked through an embedded free list of 16 bit indices. Allocation and
//!   deallocation are a couple of loads and stores.
//! * `fixed`: a growable collection of buckets of one block size, with
//!   cached hot buckets for allocation, deallocation and empty bucket
//!   reclamation.
//! * `allocator`: an array of fixed size allocators, one per byte size up
//!   to a configurable maximum (128 by default), plus a passthrough to the
//!   system allocator for anything larger.
//!
//! A single process wide instance behind a mutex is available through
//! [`Poolloc::global`]:
//!
//! ```rust
//! use poolloc::Poolloc;
//!
//! let pool = Poolloc::global();
//!
//! let address = pool.allocate(12).unwrap();
//!
//! unsafe {
//!     address.as_ptr().write_bytes(0, 12);
//!     pool.deallocate(address, 12);
//! }
//! ```
//!
//! Bucket memory comes straight from the kernel, `mmap` on unix and
//! `VirtualAlloc` on windows, never from the default heap, and released
//! buckets go straight back. Under Miri the mappings are mocked with the
//! global allocator so the whole crate stays testable.
//!
//! The `extra-checks` cargo feature adds a linear double free scan to every
//! deallocation in debug builds. It is far too expensive for release use.

use std::ptr::NonNull;

mod allocator;
mod bucket;
mod error;
mod fixed;
mod platform;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation return types.
pub(crate) type AllocResult = Result<NonNull<u8>, error::PoolError>;

pub use allocator::Poolloc;
pub use error::PoolError;
