use std::collections::TryReserveError;

use thiserror::Error;

/// Failures that pool operations can report. Every variant is an out of
/// memory condition, and the pool is left exactly as it was before the
/// failed call, so a caller that frees memory elsewhere may simply retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The kernel refused to map a new bucket region.
    #[error("the kernel refused to map a bucket of {0} bytes")]
    MapFailed(usize),

    /// Growing the bucket table of a size class failed. The bucket that was
    /// about to be appended has already returned its mapping to the kernel.
    #[error("failed to grow the bucket table")]
    TableGrowFailed(#[from] TryReserveError),

    /// The system allocator refused an oversize request.
    #[error("the system allocator refused {0} bytes")]
    SystemAllocFailed(usize),
}
