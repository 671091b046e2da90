//! # Page Allocators
//!
//! Whole pages straight from the OS, bypassing the heap. Meant for large
//! transient buffers where heap fragmentation or TLB locality matters.
//!
//! - [`PageKind::Mid`]: plain pages.
//! - [`PageKind::Big`]: large pages when the request is more than half a
//!   large page, plain pages otherwise or when the large-page request fails.
//!
//! | Platform | Plain pages | Large pages |
//! |----------|-------------|-------------|
//! | Linux / Android | `mmap` | `mmap(MAP_HUGETLB)` |
//! | Other Unix | `mmap` | never |
//! | Windows | `VirtualAlloc` | `VirtualAlloc(MEM_LARGE_PAGES)` |
//! | Other | C heap | never |
//!
//! ## Usage
//!
//! ```rust
//! use lzkit_platform::alloc::{Allocator, LargePagePolicy, PageAllocator, PageAllocatorConfig};
//!
//! let config = PageAllocatorConfig::builder()
//!     .big()
//!     .large_pages(LargePagePolicy::Disabled)
//!     .build()
//!     .unwrap();
//! let pages = PageAllocator::new(config).unwrap();
//!
//! let ptr = pages.allocate(1 << 20);
//! assert!(!ptr.is_null());
//! unsafe { pages.free(ptr) };
//! ```

use super::large_page::{self, large_page_len};
use super::stats::{AllocKind, AllocationStats, DebugCounters};
use super::table::{BlockTable, RawBlock};
use super::{AllocError, Allocator, ConfigError};
use std::ptr::NonNull;

/// Which page allocator flavor to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageKind {
    /// Plain OS pages.
    #[default]
    Mid,
    /// Large pages when worthwhile, plain pages otherwise.
    Big,
}

/// Where a big page allocator gets its large page size from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LargePagePolicy {
    /// The process-wide probed size.
    #[default]
    Auto,
    /// Never use large pages.
    Disabled,
    /// A fixed size, which must be a power of two.
    Fixed(usize),
}

/// Configuration for a [`PageAllocator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageAllocatorConfig {
    /// Allocator flavor.
    pub kind: PageKind,
    /// Large page size source. Only used by [`PageKind::Big`].
    pub large_pages: LargePagePolicy,
    /// Count live blocks and trace every call.
    pub debug: bool,
}

impl PageAllocatorConfig {
    /// Create a new builder for `PageAllocatorConfig`.
    #[must_use]
    pub fn builder() -> PageAllocatorConfigBuilder {
        PageAllocatorConfigBuilder::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::LargePageSize`] if a fixed large page size is
    /// zero, not a power of two, or above [`large_page::MAX_LARGE_PAGE`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let LargePagePolicy::Fixed(size) = self.large_pages {
            if !size.is_power_of_two() || size > large_page::MAX_LARGE_PAGE {
                return Err(ConfigError::LargePageSize(size));
            }
        }
        Ok(())
    }
}

/// Builder for [`PageAllocatorConfig`].
#[derive(Debug, Default)]
pub struct PageAllocatorConfigBuilder {
    config: PageAllocatorConfig,
}

impl PageAllocatorConfigBuilder {
    /// Set the allocator flavor.
    #[must_use]
    pub const fn kind(mut self, kind: PageKind) -> Self {
        self.config.kind = kind;
        self
    }

    /// Shorthand for `kind(PageKind::Mid)`.
    #[must_use]
    pub const fn mid(self) -> Self {
        self.kind(PageKind::Mid)
    }

    /// Shorthand for `kind(PageKind::Big)`.
    #[must_use]
    pub const fn big(self) -> Self {
        self.kind(PageKind::Big)
    }

    /// Set the large page policy.
    #[must_use]
    pub const fn large_pages(mut self, policy: LargePagePolicy) -> Self {
        self.config.large_pages = policy;
        self
    }

    /// Enable debug counters and tracing.
    #[must_use]
    pub const fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn build(self) -> Result<PageAllocatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation (for testing).
    #[must_use]
    pub fn build_unchecked(self) -> PageAllocatorConfig {
        self.config
    }
}

/// OS page allocator.
///
/// Every live block is recorded in a side table so that `free` knows the
/// mapping length and whether large pages back it.
#[derive(Debug)]
pub struct PageAllocator {
    config: PageAllocatorConfig,
    blocks: BlockTable,
    stats: DebugCounters,
}

impl PageAllocator {
    /// Create an allocator from a configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: PageAllocatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    /// Plain page allocator.
    #[must_use]
    pub fn mid() -> Self {
        Self::from_valid(PageAllocatorConfig::default())
    }

    /// Big page allocator using the process-wide large page size.
    #[must_use]
    pub fn big() -> Self {
        Self::from_valid(PageAllocatorConfig {
            kind: PageKind::Big,
            ..PageAllocatorConfig::default()
        })
    }

    fn from_valid(config: PageAllocatorConfig) -> Self {
        Self {
            stats: DebugCounters::new(config.debug),
            blocks: BlockTable::new(),
            config,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &PageAllocatorConfig {
        &self.config
    }

    /// Debug counters. All zero unless debug mode is on.
    #[must_use]
    pub fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Large page size this allocator rounds to, `0` when it never uses
    /// large pages.
    #[must_use]
    pub fn large_page_size(&self) -> usize {
        if self.config.kind == PageKind::Mid {
            return 0;
        }
        match self.config.large_pages {
            LargePagePolicy::Auto => large_page::large_page_size(),
            LargePagePolicy::Disabled => 0,
            LargePagePolicy::Fixed(size) => large_page::sanitize(size),
        }
    }

    fn map_plain(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = os::map(size, None)?;
        self.blocks.insert(ptr, RawBlock::new(ptr, size));
        Ok(ptr)
    }

    fn alloc_big(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let page = self.large_page_size();
        if let Some(len) = large_page_len(size, page) {
            match os::map(len, Some(page)) {
                Ok(ptr) => {
                    self.blocks.insert(
                        ptr,
                        RawBlock {
                            ptr,
                            len,
                            large: true,
                        },
                    );
                    self.stats.note(AllocKind::AllocBigLarge, len, ptr.as_ptr());
                    return Ok(ptr);
                }
                Err(err) => {
                    tracing::debug!(size, len, %err, "large page allocation failed, using plain pages");
                }
            }
        }

        let ptr = self.map_plain(size)?;
        self.stats.note(AllocKind::AllocMid, size, ptr.as_ptr());
        Ok(ptr)
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::mid()
    }
}

impl Allocator for PageAllocator {
    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let (ptr, kind) = match self.config.kind {
            PageKind::Mid => (self.map_plain(size)?, AllocKind::AllocMid),
            PageKind::Big => (self.alloc_big(size)?, AllocKind::AllocBig),
        };
        self.stats.on_alloc(kind, size, ptr.as_ptr());
        Ok(ptr)
    }

    #[allow(unsafe_code)]
    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(block) = self.blocks.remove(ptr) else {
            tracing::warn!(addr = ?ptr, "free of an address this page allocator never returned");
            return;
        };

        let kind = match self.config.kind {
            PageKind::Mid => AllocKind::FreeMid,
            PageKind::Big => AllocKind::FreeBig,
        };
        self.stats.on_free(kind, ptr);
        os::unmap(block);
    }
}

#[cfg(unix)]
mod os {
    use super::{AllocError, RawBlock};
    use std::io;
    use std::ptr::{self, NonNull};

    /// From `<linux/mman.h>`: log2 of the huge page size sits above this bit.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const MAP_HUGE_SHIFT: libc::c_int = 26;

    /// Flags requesting huge pages of exactly `page` bytes. Without the size
    /// bits the kernel picks its default huge page size, which `munmap` of a
    /// shorter length then rejects.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[allow(clippy::cast_possible_wrap)]
    pub(super) const fn huge_flags(page: usize) -> Option<libc::c_int> {
        Some(libc::MAP_HUGETLB | ((page.trailing_zeros() as libc::c_int) << MAP_HUGE_SHIFT))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(super) const fn huge_flags(_page: usize) -> Option<libc::c_int> {
        None
    }

    #[allow(unsafe_code)]
    pub(super) fn map(len: usize, large_page: Option<usize>) -> Result<NonNull<u8>, AllocError> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if let Some(page) = large_page {
            flags |= huge_flags(page).ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))?;
        }

        // SAFETY: an anonymous private mapping at a kernel-chosen address
        // aliases no existing memory.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        NonNull::new(addr.cast()).ok_or(AllocError::exhausted(len))
    }

    #[allow(unsafe_code)]
    pub(super) fn unmap(block: RawBlock) {
        // SAFETY: the block is a live mapping of exactly `len` bytes created
        // by `map` and removed from the side table before this call.
        let rc = unsafe { libc::munmap(block.ptr.as_ptr().cast(), block.len) };
        if rc != 0 {
            tracing::warn!(
                addr = ?block.ptr,
                len = block.len,
                err = %io::Error::last_os_error(),
                "munmap failed"
            );
        }
    }
}

#[cfg(windows)]
mod os {
    use super::{AllocError, RawBlock};
    use std::io;
    use std::ptr::{self, NonNull};
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_LARGE_PAGES, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    #[allow(unsafe_code)]
    pub(super) fn map(len: usize, large_page: Option<usize>) -> Result<NonNull<u8>, AllocError> {
        let mut flags = MEM_COMMIT | MEM_RESERVE;
        // The only large page size is GetLargePageMinimum's.
        if large_page.is_some() {
            flags |= MEM_LARGE_PAGES;
        }
        // SAFETY: a fresh reservation at a system-chosen address aliases no
        // existing memory.
        let addr = unsafe { VirtualAlloc(ptr::null_mut(), len, flags, PAGE_READWRITE) };
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::last_os_error().into())
    }

    #[allow(unsafe_code)]
    pub(super) fn unmap(block: RawBlock) {
        // SAFETY: the block is the base of a live reservation created by `map`.
        let ok = unsafe { VirtualFree(block.ptr.as_ptr().cast(), 0, MEM_RELEASE) };
        if ok == 0 {
            tracing::warn!(
                addr = ?block.ptr,
                len = block.len,
                err = %io::Error::last_os_error(),
                "VirtualFree failed"
            );
        }
    }
}

/// No page API: the C heap stands in.
#[cfg(not(any(unix, windows)))]
mod os {
    use super::{AllocError, RawBlock};
    use crate::alloc::{Allocator, StandardAllocator};
    use std::ptr::NonNull;

    static HEAP: StandardAllocator = StandardAllocator::new();

    pub(super) fn map(len: usize, large_page: Option<usize>) -> Result<NonNull<u8>, AllocError> {
        if large_page.is_some() {
            return Err(AllocError::exhausted(len));
        }
        HEAP.try_allocate(len)
    }

    #[allow(unsafe_code)]
    pub(super) fn unmap(block: RawBlock) {
        // SAFETY: the block came from `HEAP` and is released once.
        unsafe { HEAP.free(block.ptr.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PageAllocatorConfig::default();
        assert_eq!(config.kind, PageKind::Mid);
        assert_eq!(config.large_pages, LargePagePolicy::Auto);
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PageAllocatorConfig::builder()
            .big()
            .large_pages(LargePagePolicy::Fixed(2 << 20))
            .debug(true)
            .build()
            .unwrap();
        assert_eq!(config.kind, PageKind::Big);
        assert_eq!(config.large_pages, LargePagePolicy::Fixed(2 << 20));
        assert!(config.debug);
    }

    #[test]
    fn test_validate_fixed_size() {
        for bad in [0, 3 << 20, 2 << 30] {
            let result = PageAllocatorConfig::builder()
                .big()
                .large_pages(LargePagePolicy::Fixed(bad))
                .build();
            assert!(matches!(result, Err(ConfigError::LargePageSize(s)) if s == bad));
        }

        let unchecked = PageAllocatorConfig::builder()
            .large_pages(LargePagePolicy::Fixed(3))
            .build_unchecked();
        assert!(PageAllocator::new(unchecked).is_err());
    }

    #[test]
    fn test_large_page_size_by_policy() {
        assert_eq!(PageAllocator::mid().large_page_size(), 0);

        let disabled = PageAllocatorConfig::builder()
            .big()
            .large_pages(LargePagePolicy::Disabled)
            .build_unchecked();
        assert_eq!(PageAllocator::new(disabled).unwrap().large_page_size(), 0);

        let fixed = PageAllocatorConfig::builder()
            .big()
            .large_pages(LargePagePolicy::Fixed(1 << 21))
            .build_unchecked();
        assert_eq!(PageAllocator::new(fixed).unwrap().large_page_size(), 1 << 21);

        assert_eq!(
            PageAllocator::big().large_page_size(),
            large_page::large_page_size()
        );
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_mid_returns_page_aligned_blocks() {
        let pages = PageAllocator::mid();
        let ptr = pages.allocate(10_000);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 4096, 0);
        assert_eq!(pages.live_blocks(), 1);

        unsafe {
            std::ptr::write_bytes(ptr, 0x5A, 10_000);
            assert_eq!(*ptr.add(9_999), 0x5A);
            pages.free(ptr);
        }
        assert_eq!(pages.live_blocks(), 0);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_zero_and_null() {
        let pages = PageAllocator::big();
        assert!(pages.allocate(0).is_null());
        unsafe { pages.free(std::ptr::null_mut()) };
        assert_eq!(pages.live_blocks(), 0);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_fixed_large_pages_fall_back() {
        // Succeeds whether or not the host has huge pages reserved.
        let config = PageAllocatorConfig::builder()
            .big()
            .large_pages(LargePagePolicy::Fixed(2 << 20))
            .debug(true)
            .build()
            .unwrap();
        let pages = PageAllocator::new(config).unwrap();

        let ptr = pages.allocate(3 << 20);
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr, 1, 3 << 20);
            pages.free(ptr);
        }
        assert!(pages.stats().is_balanced());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_huge_flags_carry_page_size() {
        let shift = 26;
        assert_eq!(os::huge_flags(2 << 20), Some(libc::MAP_HUGETLB | (21 << shift)));
        assert_eq!(os::huge_flags(1 << 30), Some(libc::MAP_HUGETLB | (30 << shift)));
        assert_eq!(os::huge_flags(4096), Some(libc::MAP_HUGETLB | (12 << shift)));
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_fixed_page_below_kernel_default_unmaps() {
        // 4 KiB is never a huge page size, so the mapping falls back.
        let config = PageAllocatorConfig::builder()
            .big()
            .large_pages(LargePagePolicy::Fixed(4096))
            .debug(true)
            .build()
            .unwrap();
        let pages = PageAllocator::new(config).unwrap();

        let blocks: Vec<_> = (0..4).map(|_| pages.allocate(8192)).collect();
        for &ptr in &blocks {
            assert!(!ptr.is_null());
            unsafe { std::ptr::write_bytes(ptr, 2, 8192) };
        }
        for ptr in blocks {
            unsafe { pages.free(ptr) };
        }
        assert_eq!(pages.live_blocks(), 0);
        assert!(pages.stats().is_balanced());
    }
}
