//! # `lzkit` Platform Layer
//!
//! The platform-abstraction layer under the `lzkit` compression engine.
//!
//! This crate provides:
//! - **Feature detection**: which CPU extensions (SSE through AVX2, AES, SHA,
//!   NEON, CRC32) the current CPU *and* OS can use, so codec kernels can
//!   dispatch at runtime
//! - **Allocators**: one [`alloc::Allocator`] interface over the C heap, OS
//!   pages with optional large pages, 128-byte aligned blocks, and blocks
//!   with an aligned interior field
//!
//! ## Design Principles
//!
//! 1. **Never fail loudly** - unknown features read as unsupported, failed
//!    allocations return null
//! 2. **No hidden state in the hot path** - feature queries are pure, the
//!    large page size is probed once
//! 3. **Testable decode logic** - CPUID and hwcap decoding run against
//!    synthetic inputs on any host
//!
//! ## Example
//!
//! ```rust
//! use lzkit_platform::alloc::{self, Allocator};
//! use lzkit_platform::detect;
//!
//! let info = lzkit_platform::init();
//! println!("{} via {}: {}", info.platform, info.backend, info.features.summary());
//!
//! if detect::has_avx2() {
//!     // pick the 256-bit match finder
//! }
//!
//! let window = alloc::big().allocate(1 << 22);
//! assert!(!window.is_null());
//! unsafe { alloc::big().free(window) };
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Will selectively allow where needed with justification
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod detect;

// Re-export key types
pub use alloc::{AllocError, Allocator, AllocatorExt, ConfigError};
pub use detect::{CpuFeatures, FeatureFlag, Platform, ProbeBackend, SimdLevel};

/// Result type for lzkit-platform operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lzkit-platform
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocation failures
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),

    /// Rejected allocator configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// What [`init`] found out about the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Operating system family
    pub platform: Platform,
    /// Where feature answers come from
    pub backend: ProbeBackend,
    /// Feature snapshot
    pub features: CpuFeatures,
    /// L1 data cache line size in bytes
    pub cache_line_size: usize,
    /// Large page size in bytes, 0 if unavailable
    pub large_page_size: usize,
}

/// Probe everything once and log a summary.
///
/// Calling this is optional. It fixes the large page size before the first
/// big allocation and is safe to call repeatedly.
#[must_use = "the returned info is the only way to see what was detected"]
pub fn init() -> PlatformInfo {
    let info = PlatformInfo {
        platform: Platform::detect(),
        backend: ProbeBackend::current(),
        features: CpuFeatures::detect(),
        cache_line_size: detect::cache_line_size(),
        large_page_size: alloc::init_large_pages(),
    };

    tracing::info!(
        platform = %info.platform,
        backend = %info.backend,
        simd = %info.features.simd_level(),
        features = %info.features.summary(),
        cache_line = info.cache_line_size,
        large_page = info.large_page_size,
        "platform initialized"
    );

    info
}
