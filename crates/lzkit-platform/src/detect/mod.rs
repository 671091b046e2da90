//! # CPU Feature Detection
//!
//! Runtime queries for the instruction-set extensions codec kernels dispatch on.
//!
//! ## Overview
//!
//! Every query is a pure function of the current CPU and OS:
//!
//! - no initialization is needed and nothing is cached,
//! - a query never blocks and never fails loudly,
//! - anything that cannot be determined is reported as unsupported.
//!
//! Implications between flags always hold: `AVX2 ⇒ AVX`, and on x86
//! `SHA512 ⇒ AVX2` and `VAES-AVX2 ⇒ AVX2`.
//!
//! ## Usage
//!
//! ```rust
//! use lzkit_platform::detect::{self, FeatureFlag};
//!
//! if detect::has_avx2() {
//!     // 256-bit kernels
//! }
//! assert_eq!(detect::supports(FeatureFlag::Avx2), detect::has_avx2());
//!
//! let features = detect::CpuFeatures::detect();
//! println!("{} ({})", features.simd_level(), features.summary());
//! ```
//!
//! ## Platform Support
//!
//! | Family | Windows | Linux / Android | FreeBSD | Apple |
//! |--------|---------|-----------------|---------|-------|
//! | x86 / x86\_64 | CPUID + XGETBV | CPUID + XGETBV | CPUID + XGETBV | CPUID + XGETBV |
//! | ARM / AArch64 | `IsProcessorFeaturePresent` | `getauxval` | `elf_aux_info` | `sysctlbyname` |

mod arm;
mod cache;
mod flags;
pub(crate) mod x86;

pub use cache::{cache_line_size, DEFAULT_CACHE_LINE};
pub use flags::FeatureFlag;

/// Whether `flag` is usable on the current CPU and OS.
///
/// Flags belonging to another architecture family are always `false`.
#[must_use]
pub fn supports(flag: FeatureFlag) -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        x86::probe(&x86::NativeCpuid, flag)
    }

    #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
    {
        arm::probe(flag)
    }

    #[cfg(not(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64"
    )))]
    {
        let _ = flag;
        false
    }
}

macro_rules! feature_fns {
    ($($(#[$doc:meta])* $name:ident => $flag:ident;)*) => {
        $(
            $(#[$doc])*
            #[must_use]
            #[inline]
            pub fn $name() -> bool {
                supports(FeatureFlag::$flag)
            }
        )*
    };
}

feature_fns! {
    /// Conditional move.
    has_cmov => Cmov;
    /// SSE with OS register-state support.
    has_sse => Sse;
    /// SSE2 with OS register-state support.
    has_sse2 => Sse2;
    /// SSSE3.
    has_ssse3 => Ssse3;
    /// SSE4.1.
    has_sse41 => Sse41;
    /// Hardware AES (AES-NI or ARMv8 AES).
    has_aes => Aes;
    /// x86 SHA extensions.
    has_sha => Sha;
    /// SHA-512 instructions.
    has_sha512 => Sha512;
    /// AVX, confirmed by CPU, OS and XCR0.
    has_avx => Avx;
    /// AVX2.
    has_avx2 => Avx2;
    /// VAES together with AVX2.
    has_vaes_avx2 => VaesAvx2;
    /// 1 GiB pages.
    has_page_1gb => PageGb;
    /// ARM Advanced SIMD.
    has_neon => Neon;
    /// ARMv8 CRC32.
    has_crc32 => Crc32;
    /// ARMv8 SHA-1.
    has_sha1 => Sha1;
    /// ARMv8 SHA-256.
    has_sha2 => Sha2;
    /// ARMv8 AES + SHA-1 + SHA-256.
    has_crypto => Crypto;
}

/// A snapshot of every [`FeatureFlag`] taken at one point in time.
///
/// Taking a snapshot is optional; [`supports`] is always available.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuFeatures {
    bits: u32,
}

impl CpuFeatures {
    /// Evaluate every flag for the current processor.
    #[must_use]
    pub fn detect() -> Self {
        FeatureFlag::ALL
            .into_iter()
            .filter(|&flag| supports(flag))
            .collect()
    }

    /// A snapshot with no flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Copy of `self` with `flag` set.
    #[must_use]
    pub const fn with(self, flag: FeatureFlag) -> Self {
        Self {
            bits: self.bits | flag.bit(),
        }
    }

    /// Whether `flag` was supported when the snapshot was taken.
    #[must_use]
    pub const fn contains(&self, flag: FeatureFlag) -> bool {
        self.bits & flag.bit() != 0
    }

    /// Whether no flag is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of flags set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// The set flags, in [`FeatureFlag::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = FeatureFlag> + '_ {
        FeatureFlag::ALL
            .into_iter()
            .filter(move |&flag| self.contains(flag))
    }

    /// Check if any SIMD path is available.
    #[must_use]
    pub const fn has_simd(&self) -> bool {
        self.contains(FeatureFlag::Sse2) || self.contains(FeatureFlag::Neon)
    }

    /// Widest SIMD level in the snapshot.
    #[must_use]
    pub const fn simd_level(&self) -> SimdLevel {
        if self.contains(FeatureFlag::Avx2) {
            SimdLevel::Avx2
        } else if self.contains(FeatureFlag::Avx) {
            SimdLevel::Avx
        } else if self.contains(FeatureFlag::Sse41) {
            SimdLevel::Sse41
        } else if self.contains(FeatureFlag::Ssse3) {
            SimdLevel::Ssse3
        } else if self.contains(FeatureFlag::Sse2) {
            SimdLevel::Sse2
        } else if self.contains(FeatureFlag::Neon) {
            SimdLevel::Neon
        } else {
            SimdLevel::None
        }
    }

    /// Comma-separated flag names, or `"None"`.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "None".to_string();
        }
        self.iter()
            .map(FeatureFlag::name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Log the snapshot at `info` level.
    pub fn log_summary(&self) {
        tracing::info!("CPU backend: {}", ProbeBackend::current());
        tracing::info!("SIMD: {}", self.simd_level());
        tracing::info!("CPU features: {}", self.summary());
    }
}

impl FromIterator<FeatureFlag> for CpuFeatures {
    fn from_iter<I: IntoIterator<Item = FeatureFlag>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl std::fmt::Debug for CpuFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// SIMD capability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimdLevel {
    /// No SIMD support
    None,
    /// ARM NEON (128-bit)
    Neon,
    /// x86 SSE2 (128-bit)
    Sse2,
    /// x86 SSSE3 (128-bit byte shuffles)
    Ssse3,
    /// x86 SSE4.1 (128-bit)
    Sse41,
    /// x86 AVX (256-bit float)
    Avx,
    /// x86 AVX2 (256-bit integer)
    Avx2,
}

impl std::fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimdLevel::None => write!(f, "None"),
            SimdLevel::Neon => write!(f, "NEON"),
            SimdLevel::Sse2 => write!(f, "SSE2"),
            SimdLevel::Ssse3 => write!(f, "SSSE3"),
            SimdLevel::Sse41 => write!(f, "SSE4.1"),
            SimdLevel::Avx => write!(f, "AVX"),
            SimdLevel::Avx2 => write!(f, "AVX2"),
        }
    }
}

/// Detected platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux
    Linux,
    /// Android
    Android,
    /// macOS / iOS
    Apple,
    /// Windows
    Windows,
    /// FreeBSD
    FreeBSD,
    /// Other/unknown
    Other,
}

impl Platform {
    /// Detect the current platform.
    #[must_use]
    pub const fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Linux
        }
        #[cfg(target_os = "android")]
        {
            Self::Android
        }
        #[cfg(target_vendor = "apple")]
        {
            Self::Apple
        }
        #[cfg(target_os = "windows")]
        {
            Self::Windows
        }
        #[cfg(target_os = "freebsd")]
        {
            Self::FreeBSD
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_vendor = "apple",
            target_os = "windows",
            target_os = "freebsd"
        )))]
        {
            Self::Other
        }
    }

    /// Check if this is a Unix-like platform.
    #[must_use]
    pub const fn is_unix(&self) -> bool {
        matches!(
            self,
            Self::Linux | Self::Android | Self::Apple | Self::FreeBSD
        )
    }

    /// Check if whole pages can be requested from the OS directly.
    ///
    /// Unix systems without their own variant (the other BSDs, illumos)
    /// report [`Platform::Other`] but still have `mmap`.
    #[must_use]
    pub const fn has_page_api(&self) -> bool {
        !matches!(self, Self::Other) || cfg!(unix)
    }

    /// Check if the OS exposes a large page size this crate can query.
    #[must_use]
    pub const fn has_large_page_query(&self) -> bool {
        matches!(self, Self::Linux | Self::Android | Self::Windows)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "Linux"),
            Self::Android => write!(f, "Android"),
            Self::Apple => write!(f, "Apple"),
            Self::Windows => write!(f, "Windows"),
            Self::FreeBSD => write!(f, "FreeBSD"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// Where [`supports`] gets its answers on this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBackend {
    /// CPUID and XGETBV, read directly.
    Cpuid,
    /// `IsProcessorFeaturePresent`.
    ProcessorFeature,
    /// Kernel `AT_HWCAP` / `AT_HWCAP2` masks.
    HwCap,
    /// `sysctlbyname("hw.optional.*")`.
    Sysctl,
    /// Nothing to ask; only compile-time guarantees are reported.
    None,
}

impl ProbeBackend {
    /// Backend selected for the current target.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Self::Cpuid
        } else if !cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            Self::None
        } else if cfg!(windows) {
            Self::ProcessorFeature
        } else if cfg!(target_vendor = "apple") {
            Self::Sysctl
        } else if cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd"
        )) {
            Self::HwCap
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for ProbeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpuid => "cpuid",
            Self::ProcessorFeature => "IsProcessorFeaturePresent",
            Self::HwCap => "hwcap",
            Self::Sysctl => "sysctl",
            Self::None => "none",
        };
        f.write_str(name)
    }
}
