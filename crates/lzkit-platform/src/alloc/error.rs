//! # Allocation Error Types
//!
//! Every allocator reports failure as a null pointer through
//! [`Allocator::allocate`](super::Allocator::allocate); these categories are
//! what [`Allocator::try_allocate`](super::Allocator::try_allocate) exposes.

/// Why an allocation request produced no block.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// Zero-byte requests never allocate
    #[error("zero-size allocation requested")]
    ZeroSize,

    /// The request plus the allocator's bookkeeping overhead wraps around
    #[error("allocation size overflow: {size} bytes + {overhead} bytes overhead")]
    SizeOverflow {
        /// Requested size
        size: usize,
        /// Bytes the allocator adds on top of the request
        overhead: usize,
    },

    /// The heap or the OS refused the request
    #[error("out of memory allocating {size} bytes")]
    Exhausted {
        /// Bytes requested from the underlying primitive
        size: usize,
    },

    /// The allocator's configuration can never satisfy a request
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// An OS call failed with a specific error
    #[error("system call failed: {0}")]
    Os(#[from] std::io::Error),
}

/// Rejected allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Fixed large page size that is zero, not a power of two, or above 1 GiB
    #[error("large page size must be a power of two up to 1 GiB, got {0}")]
    LargePageSize(usize),

    /// Alignment exponent too large for the address width
    #[error("alignment of 2^{0} bytes does not fit in a pointer")]
    AlignBits(u32),

    /// Interior offset not below the effective alignment
    #[error("offset {offset} must be below alignment {alignment}")]
    Offset {
        /// Configured interior offset
        offset: usize,
        /// Effective alignment
        alignment: usize,
    },
}

impl AllocError {
    /// Exhaustion for a request of `size` bytes.
    #[must_use]
    pub const fn exhausted(size: usize) -> Self {
        Self::Exhausted { size }
    }

    /// Whether retrying with a smaller request could succeed.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Os(_))
    }
}
