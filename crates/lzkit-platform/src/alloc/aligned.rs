//! # Cache-Aligned Allocator
//!
//! Every block starts on a 128-byte boundary, which is wider than common
//! cache lines and keeps independently allocated structures from sharing
//! one.
//!
//! Two strategies give the same guarantee:
//!
//! - **Native**: `posix_memalign` on Unix, `_aligned_malloc` on Windows.
//! - **Manual**: over-allocate `size + 128` from the C heap and carve the
//!   aligned block out of it. The raw block is found again on free through
//!   a side table.

use super::stats::{AllocKind, AllocationStats, DebugCounters};
use super::table::{BlockTable, RawBlock};
use super::{AllocError, Allocator, StandardAllocator};
use std::mem;
use std::ptr::NonNull;

/// Alignment of every block returned by [`AlignedAllocator`].
pub const ALIGNMENT: usize = 1 << 7;

/// How an [`AlignedAllocator`] obtains aligned memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignStrategy {
    /// The platform's aligned allocation call. Falls back to
    /// [`Manual`](Self::Manual) where none exists.
    #[default]
    Native,
    /// Over-allocation from the C heap plus a side table.
    Manual,
}

impl AlignStrategy {
    /// Strategy actually used on this platform.
    #[must_use]
    pub const fn effective(self) -> Self {
        if cfg!(any(unix, windows)) {
            self
        } else {
            Self::Manual
        }
    }
}

/// 128-byte aligned allocator.
#[derive(Debug)]
pub struct AlignedAllocator {
    strategy: AlignStrategy,
    heap: StandardAllocator,
    blocks: BlockTable,
    stats: DebugCounters,
}

impl AlignedAllocator {
    /// Allocator using the platform's aligned allocation call.
    #[must_use]
    pub fn native() -> Self {
        Self::with_strategy(AlignStrategy::Native, false)
    }

    /// Allocator carving aligned blocks out of the C heap.
    #[must_use]
    pub fn manual() -> Self {
        Self::with_strategy(AlignStrategy::Manual, false)
    }

    /// Allocator with an explicit strategy and debug mode.
    #[must_use]
    pub fn with_strategy(strategy: AlignStrategy, debug: bool) -> Self {
        Self {
            strategy: strategy.effective(),
            heap: StandardAllocator::new(),
            blocks: BlockTable::new(),
            stats: DebugCounters::new(debug),
        }
    }

    /// Strategy in use.
    #[must_use]
    pub const fn strategy(&self) -> AlignStrategy {
        self.strategy
    }

    /// Debug counters. All zero unless debug mode is on.
    #[must_use]
    pub fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }

    /// Number of side-table records. Always zero for the native strategy.
    #[must_use]
    pub fn tracked_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn alloc_manual(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let raw_len = size.checked_add(ALIGNMENT).ok_or(AllocError::SizeOverflow {
            size,
            overhead: ALIGNMENT,
        })?;
        let raw = self.heap.try_allocate(raw_len)?;

        // First boundary at or after one pointer past the raw start. The heap
        // returns pointer-aligned blocks, so this stays inside `raw_len`.
        let start = raw.as_ptr() as usize;
        let aligned = (start + mem::size_of::<usize>() + ALIGNMENT - 1) & !(ALIGNMENT - 1);
        let user = raw.as_ptr().wrapping_add(aligned - start);
        let user = NonNull::new(user).ok_or(AllocError::exhausted(raw_len))?;

        self.blocks.insert(user, RawBlock::new(raw, raw_len));
        Ok(user)
    }

    #[cfg(unix)]
    #[allow(unsafe_code, clippy::unused_self)]
    fn alloc_native(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut out: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: `out` is a valid out-pointer and ALIGNMENT is a power of
        // two multiple of the pointer size.
        let rc = unsafe { libc::posix_memalign(&mut out, ALIGNMENT, size) };
        if rc != 0 {
            return Err(AllocError::exhausted(size));
        }
        NonNull::new(out.cast()).ok_or(AllocError::exhausted(size))
    }

    #[cfg(windows)]
    #[allow(unsafe_code, clippy::unused_self)]
    fn alloc_native(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: ALIGNMENT is a power of two; null is returned on failure.
        let out = unsafe { libc::aligned_malloc(size, ALIGNMENT) };
        NonNull::new(out.cast()).ok_or(AllocError::exhausted(size))
    }

    #[cfg(not(any(unix, windows)))]
    fn alloc_native(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.alloc_manual(size)
    }

    #[allow(unsafe_code)]
    unsafe fn free_native(ptr: *mut u8) {
        #[cfg(unix)]
        libc::free(ptr.cast());

        #[cfg(windows)]
        libc::aligned_free(ptr.cast());

        #[cfg(not(any(unix, windows)))]
        let _ = ptr;
    }
}

impl Default for AlignedAllocator {
    fn default() -> Self {
        Self::native()
    }
}

impl Allocator for AlignedAllocator {
    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let ptr = match self.strategy {
            AlignStrategy::Native => self.alloc_native(size)?,
            AlignStrategy::Manual => self.alloc_manual(size)?,
        };
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        self.stats.on_alloc(AllocKind::Alloc, size, ptr.as_ptr());
        Ok(ptr)
    }

    #[allow(unsafe_code)]
    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // Native blocks are never in the table.
        if self.strategy == AlignStrategy::Native {
            self.stats.on_free(AllocKind::Free, ptr);
            Self::free_native(ptr);
            return;
        }

        let Some(raw) = self.blocks.remove(ptr) else {
            tracing::warn!(addr = ?ptr, "free of an address this allocator never returned");
            return;
        };
        self.stats.on_free(AllocKind::Free, ptr);
        self.heap.free(raw.ptr.as_ptr());
    }
}
