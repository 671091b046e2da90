//! # Pluggable Allocators
//!
//! A small family of allocators behind one [`Allocator`] trait:
//!
//! | Allocator | Memory | Guarantee |
//! |-----------|--------|-----------|
//! | [`StandardAllocator`] | C heap | at least `size` bytes |
//! | [`PageAllocator`] (mid) | OS pages | page aligned |
//! | [`PageAllocator`] (big) | OS large pages when worthwhile | page aligned |
//! | [`AlignedAllocator`] | C heap or native aligned call | 128-byte aligned |
//! | [`OffsetAlignedAllocator`] | any [`Allocator`] | `(p + offset) % 2^bits == 0` |
//!
//! ## Contract
//!
//! - `allocate(0)` returns null for every allocator.
//! - Failure is a null pointer, never a panic; [`Allocator::try_allocate`]
//!   says why.
//! - `free(null)` is a no-op. Freeing anything else this allocator did not
//!   return is undefined behavior, which is why `free` is `unsafe`.
//! - No call retries.
//!
//! ## Usage
//!
//! ```rust
//! use lzkit_platform::alloc::{self, Allocator, AllocatorExt};
//!
//! // Raw interface
//! let p = alloc::aligned().allocate(1000);
//! assert_eq!(p as usize % 128, 0);
//! unsafe { alloc::aligned().free(p) };
//!
//! // Owning wrapper
//! let mut block = alloc::big().allocate_block(1 << 20).unwrap();
//! block.fill(0);
//! ```

mod aligned;
mod error;
mod large_page;
mod offset;
mod page;
mod standard;
mod stats;
mod table;

pub use aligned::{AlignStrategy, AlignedAllocator, ALIGNMENT};
pub use error::{AllocError, ConfigError};
pub use large_page::{init as init_large_pages, large_page_size, MAX_LARGE_PAGE};
pub use offset::{OffsetAlignConfig, OffsetAlignedAllocator};
pub use page::{
    LargePagePolicy, PageAllocator, PageAllocatorConfig, PageAllocatorConfigBuilder, PageKind,
};
pub use standard::StandardAllocator;
pub use stats::{AllocKind, AllocationStats};

use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

/// Allocate and free untyped memory.
///
/// Implementations are shareable between threads; each call is independent.
pub trait Allocator: Send + Sync {
    /// Allocate at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::ZeroSize`] for `size == 0` and another variant
    /// for every other failure.
    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Allocate at least `size` bytes, or return null.
    fn allocate(&self, size: usize) -> *mut u8 {
        self.try_allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Release a block. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this allocator, and
    /// must not be used afterwards.
    #[allow(unsafe_code)]
    unsafe fn free(&self, ptr: *mut u8);
}

impl<A: Allocator + ?Sized> Allocator for &A {
    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).try_allocate(size)
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        (**self).allocate(size)
    }

    #[allow(unsafe_code)]
    unsafe fn free(&self, ptr: *mut u8) {
        (**self).free(ptr);
    }
}

/// Owning helpers on top of [`Allocator`].
pub trait AllocatorExt: Allocator {
    /// Allocate a block that frees itself on drop.
    ///
    /// # Errors
    ///
    /// Same as [`Allocator::try_allocate`].
    fn allocate_block(&self, size: usize) -> Result<Block<'_, Self>, AllocError> {
        let ptr = self.try_allocate(size)?;
        Ok(Block {
            ptr,
            len: size,
            allocator: self,
        })
    }
}

impl<A: Allocator + ?Sized> AllocatorExt for A {}

/// A live allocation with automatic cleanup.
///
/// The contents start uninitialized.
pub struct Block<'a, A: Allocator + ?Sized> {
    ptr: NonNull<u8>,
    len: usize,
    allocator: &'a A,
}

// SAFETY: Block owns its memory exclusively, and A is Sync.
#[allow(unsafe_code)]
unsafe impl<A: Allocator + ?Sized> Send for Block<'_, A> {}
// SAFETY: shared access only hands out `*const u8` and, for initialized
// contents, `&[u8]`.
#[allow(unsafe_code)]
unsafe impl<A: Allocator + ?Sized> Sync for Block<'_, A> {}

impl<'a, A: Allocator + ?Sized> Block<'a, A> {
    /// Get a pointer to the block.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get a mutable pointer to the block.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Requested size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-size blocks cannot be allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The allocator this block returns to.
    #[must_use]
    pub fn allocator(&self) -> &'a A {
        self.allocator
    }

    /// The contents as possibly-uninitialized bytes.
    #[allow(unsafe_code)]
    pub fn as_uninit_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: the block is `len` bytes, exclusively owned, and
        // MaybeUninit has no validity requirement.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len) }
    }

    /// Set every byte to `value` and return the now-initialized contents.
    #[allow(unsafe_code)]
    pub fn fill(&mut self, value: u8) -> &mut [u8] {
        // SAFETY: the block is `len` writable bytes, and after write_bytes
        // all of them are initialized.
        unsafe {
            ptr::write_bytes(self.ptr.as_ptr(), value, self.len);
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
        }
    }

    /// Get as a byte slice.
    ///
    /// # Safety
    ///
    /// The block must be fully initialized.
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Get as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The block must be fully initialized.
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }

    /// Give up ownership without freeing.
    #[must_use]
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl<A: Allocator + ?Sized> Drop for Block<'_, A> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: the pointer came from this allocator and is freed once.
        unsafe { self.allocator.free(self.ptr.as_ptr()) };
    }
}

impl<A: Allocator + ?Sized> std::fmt::Debug for Block<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

static STANDARD: StandardAllocator = StandardAllocator::new();
static MID: OnceLock<PageAllocator> = OnceLock::new();
static BIG: OnceLock<PageAllocator> = OnceLock::new();
static ALIGNED: OnceLock<AlignedAllocator> = OnceLock::new();

/// Process-wide C heap allocator.
#[must_use]
pub fn standard() -> &'static StandardAllocator {
    &STANDARD
}

/// Process-wide plain page allocator.
#[must_use]
pub fn mid() -> &'static PageAllocator {
    MID.get_or_init(PageAllocator::mid)
}

/// Process-wide big page allocator using the probed large page size.
#[must_use]
pub fn big() -> &'static PageAllocator {
    BIG.get_or_init(PageAllocator::big)
}

/// Process-wide 128-byte aligned allocator.
#[must_use]
pub fn aligned() -> &'static AlignedAllocator {
    ALIGNED.get_or_init(AlignedAllocator::native)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_frees_on_drop() {
        let heap = StandardAllocator::with_debug();
        {
            let mut block = heap.allocate_block(64).unwrap();
            assert_eq!(block.len(), 64);
            assert!(!block.is_empty());
            let bytes = block.fill(0x11);
            assert!(bytes.iter().all(|&b| b == 0x11));
            assert_eq!(heap.stats().live, 1);
        }
        assert!(heap.stats().is_balanced());
    }

    #[test]
    fn test_block_zero_size() {
        assert!(matches!(
            standard().allocate_block(0),
            Err(AllocError::ZeroSize)
        ));
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_block_into_raw() {
        let heap = StandardAllocator::with_debug();
        let raw = heap.allocate_block(8).unwrap().into_raw();
        assert_eq!(heap.stats().live, 1);
        unsafe { heap.free(raw.as_ptr()) };
        assert!(heap.stats().is_balanced());
    }

    #[test]
    fn test_dyn_allocator() {
        let all: [&dyn Allocator; 4] = [standard(), mid(), big(), aligned()];
        for allocator in all {
            assert!(allocator.allocate(0).is_null());
            let mut block = allocator.allocate_block(4096).unwrap();
            block.as_uninit_mut()[4095].write(9);
            assert_eq!(unsafe_read(&block, 4095), 9);
        }
    }

    #[allow(unsafe_code)]
    fn unsafe_read<A: Allocator + ?Sized>(block: &Block<'_, A>, index: usize) -> u8 {
        unsafe { *block.as_ptr().add(index) }
    }

    #[test]
    fn test_global_handles_are_singletons() {
        assert!(std::ptr::eq(mid(), mid()));
        assert!(std::ptr::eq(big(), big()));
        assert!(std::ptr::eq(aligned(), aligned()));
        assert_eq!(mid().config().kind, PageKind::Mid);
        assert_eq!(big().config().kind, PageKind::Big);
    }
}
