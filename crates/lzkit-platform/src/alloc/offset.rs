//! # Offset-Aligned Allocator
//!
//! Aligns an interior field instead of the block start: every returned
//! address `p` satisfies `(p + offset) % alignment == 0`. Useful for records
//! whose header precedes one cache-aligned member.
//!
//! Raw memory comes from any injected [`Allocator`], so page-granular or heap
//! memory can be combined with interior alignment.
//!
//! ```rust
//! use lzkit_platform::alloc::{Allocator, OffsetAlignConfig, OffsetAlignedAllocator, StandardAllocator};
//!
//! let heap = StandardAllocator::new();
//! let records = OffsetAlignedAllocator::new(&heap, OffsetAlignConfig::new(24, 6));
//!
//! let p = records.allocate(200);
//! assert_eq!((p as usize + 24) % 64, 0);
//! unsafe { records.free(p) };
//! ```

use super::stats::{AllocKind, AllocationStats, DebugCounters};
use super::table::{BlockTable, RawBlock};
use super::{AllocError, Allocator, ConfigError};
use std::mem;
use std::ptr::NonNull;

const PTR_SIZE: usize = mem::size_of::<usize>();

/// Interior alignment request: `offset` bytes into the block must sit on a
/// `2^align_bits` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetAlignConfig {
    /// Byte offset of the aligned field inside each block.
    pub offset: usize,
    /// Alignment exponent.
    pub align_bits: u32,
}

impl OffsetAlignConfig {
    /// Create a configuration. It is checked on every allocation, not here.
    #[must_use]
    pub const fn new(offset: usize, align_bits: u32) -> Self {
        Self { offset, align_bits }
    }

    /// `max(2^align_bits, pointer size)`, or `None` if `2^align_bits` does
    /// not fit in a `usize`.
    #[must_use]
    pub const fn effective_alignment(&self) -> Option<usize> {
        match 1usize.checked_shl(self.align_bits) {
            Some(align) if align > PTR_SIZE => Some(align),
            Some(_) => Some(PTR_SIZE),
            None => None,
        }
    }

    /// Check the configuration and return the effective alignment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AlignBits`] if the alignment overflows and
    /// [`ConfigError::Offset`] if `offset` is not below the alignment.
    pub fn validate(&self) -> Result<usize, ConfigError> {
        let alignment = self
            .effective_alignment()
            .ok_or(ConfigError::AlignBits(self.align_bits))?;
        if self.offset >= alignment {
            return Err(ConfigError::Offset {
                offset: self.offset,
                alignment,
            });
        }
        Ok(alignment)
    }
}

/// Allocator placing `offset` bytes into each block on an alignment boundary.
///
/// An invalid configuration is not rejected up front; every request fails
/// with [`AllocError::InvalidConfig`] instead. Use
/// [`try_new`](Self::try_new) to reject it at construction.
#[derive(Debug)]
pub struct OffsetAlignedAllocator<A: Allocator> {
    base: A,
    config: OffsetAlignConfig,
    blocks: BlockTable,
    stats: DebugCounters,
}

impl<A: Allocator> OffsetAlignedAllocator<A> {
    /// Wrap `base` with the given configuration.
    pub fn new(base: A, config: OffsetAlignConfig) -> Self {
        Self {
            base,
            config,
            blocks: BlockTable::new(),
            stats: DebugCounters::new(false),
        }
    }

    /// Wrap `base`, rejecting an invalid configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration can never allocate.
    pub fn try_new(base: A, config: OffsetAlignConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(base, config))
    }

    /// Turn on debug counters and tracing.
    #[must_use]
    pub fn with_debug(mut self) -> Self {
        self.stats = DebugCounters::new(true);
        self
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &OffsetAlignConfig {
        &self.config
    }

    /// The allocator raw blocks come from.
    #[must_use]
    pub const fn base(&self) -> &A {
        &self.base
    }

    /// Debug counters. All zero unless debug mode is on.
    #[must_use]
    pub fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }

    /// Number of live blocks.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Distance from `start` to the lowest `p >= start` with
/// `(p + offset) % alignment == 0`.
///
/// The interior field is aligned up first and `p` steps back from it, so the
/// result is in `[0, alignment)`.
const fn placement(start: usize, alignment: usize, offset: usize) -> usize {
    let field = start.wrapping_add(offset);
    let aligned = field.wrapping_add(alignment - 1) & !(alignment - 1);
    aligned.wrapping_sub(field)
}

impl<A: Allocator> Allocator for OffsetAlignedAllocator<A> {
    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let alignment = self.config.validate()?;
        let raw_len = size.checked_add(alignment).ok_or(AllocError::SizeOverflow {
            size,
            overhead: alignment,
        })?;
        let raw = self.base.try_allocate(raw_len)?;

        let shift = placement(raw.as_ptr() as usize, alignment, self.config.offset);
        let user = NonNull::new(raw.as_ptr().wrapping_add(shift)).ok_or(AllocError::exhausted(raw_len))?;

        self.blocks.insert(user, RawBlock::new(raw, raw_len));
        self.stats.on_alloc(AllocKind::Alloc, size, user.as_ptr());
        Ok(user)
    }

    #[allow(unsafe_code)]
    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(raw) = self.blocks.remove(ptr) else {
            tracing::warn!(addr = ?ptr, "free of an address this allocator never returned");
            return;
        };
        self.stats.on_free(AllocKind::Free, ptr);
        self.base.free(raw.ptr.as_ptr());
    }
}
