//! # Standard Heap Allocator
//!
//! Thin wrapper over the C heap (`malloc` / `realloc` / `free`).
//!
//! Zero-byte requests always return null, whatever the platform heap would
//! do with them.

use super::stats::{AllocKind, AllocationStats, DebugCounters};
use super::{AllocError, Allocator};
use std::ptr::{self, NonNull};

/// C heap allocator.
#[derive(Debug, Default)]
pub struct StandardAllocator {
    stats: DebugCounters,
}

impl StandardAllocator {
    /// Allocator without debug instrumentation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stats: DebugCounters::new(false),
        }
    }

    /// Allocator that counts live blocks and traces every call.
    ///
    /// Meant for tests and leak hunting.
    #[must_use]
    pub const fn with_debug() -> Self {
        Self {
            stats: DebugCounters::new(true),
        }
    }

    /// Whether debug instrumentation is on.
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.stats.is_enabled()
    }

    /// Debug counters. All zero unless built with [`with_debug`](Self::with_debug).
    #[must_use]
    pub fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }

    /// Resize a block.
    ///
    /// - `size == 0` frees `ptr` and returns null.
    /// - A null `ptr` behaves like [`allocate`](Allocator::allocate).
    /// - On failure null is returned and `ptr` is still valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this allocator. On success the
    /// old pointer must no longer be used.
    #[allow(unsafe_code)]
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let new = libc::realloc(ptr.cast(), size).cast::<u8>();
        if !new.is_null() {
            self.stats.on_realloc(ptr, size, new);
        }
        new
    }
}

impl Allocator for StandardAllocator {
    #[allow(unsafe_code)]
    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        // SAFETY: malloc accepts any non-zero size and returns null on failure.
        let ptr = unsafe { libc::malloc(size) }.cast::<u8>();
        let ptr = NonNull::new(ptr).ok_or(AllocError::exhausted(size))?;
        self.stats.on_alloc(AllocKind::Alloc, size, ptr.as_ptr());
        Ok(ptr)
    }

    #[allow(unsafe_code)]
    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.stats.on_free(AllocKind::Free, ptr);
        libc::free(ptr.cast());
    }
}
