//! Instruction-set extension identifiers.

use std::fmt;

/// An instruction-set extension that codec kernels may dispatch on.
///
/// The meaning of each flag is fixed for the lifetime of the process. Flags
/// that belong to another architecture family always report `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureFlag {
    /// Conditional move (x86, leaf 1 EDX bit 15).
    Cmov,
    /// SSE (x86, leaf 1 EDX bit 25).
    Sse,
    /// SSE2 (x86, leaf 1 EDX bit 26).
    Sse2,
    /// SSSE3 (x86, leaf 1 ECX bit 9).
    Ssse3,
    /// SSE4.1 (x86, leaf 1 ECX bit 19).
    Sse41,
    /// Hardware AES: AES-NI on x86, ARMv8 AES on ARM.
    Aes,
    /// SHA-NI (x86, leaf 7 EBX bit 29).
    Sha,
    /// SHA-512 instructions: x86 leaf 7 subleaf 1, ARMv8.2 SHA512 on ARM.
    Sha512,
    /// AVX with OS-enabled YMM state.
    Avx,
    /// AVX2.
    Avx2,
    /// VEX-encoded VAES together with AVX2.
    VaesAvx2,
    /// 1 GiB pages (x86, extended leaf 0x8000_0001 EDX bit 26).
    PageGb,
    /// Advanced SIMD (ARM).
    Neon,
    /// CRC32 instructions (ARMv8).
    Crc32,
    /// SHA-1 instructions (ARMv8).
    Sha1,
    /// SHA-256 instructions (ARMv8).
    Sha2,
    /// Combined ARMv8 crypto extension (AES, SHA-1, SHA-256).
    Crypto,
}

impl FeatureFlag {
    /// Every flag, in declaration order.
    pub const ALL: [FeatureFlag; 17] = [
        Self::Cmov,
        Self::Sse,
        Self::Sse2,
        Self::Ssse3,
        Self::Sse41,
        Self::Aes,
        Self::Sha,
        Self::Sha512,
        Self::Avx,
        Self::Avx2,
        Self::VaesAvx2,
        Self::PageGb,
        Self::Neon,
        Self::Crc32,
        Self::Sha1,
        Self::Sha2,
        Self::Crypto,
    ];

    /// Stable human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cmov => "CMOV",
            Self::Sse => "SSE",
            Self::Sse2 => "SSE2",
            Self::Ssse3 => "SSSE3",
            Self::Sse41 => "SSE4.1",
            Self::Aes => "AES",
            Self::Sha => "SHA",
            Self::Sha512 => "SHA512",
            Self::Avx => "AVX",
            Self::Avx2 => "AVX2",
            Self::VaesAvx2 => "VAES-AVX2",
            Self::PageGb => "PAGE1GB",
            Self::Neon => "NEON",
            Self::Crc32 => "CRC32",
            Self::Sha1 => "SHA1",
            Self::Sha2 => "SHA2",
            Self::Crypto => "CRYPTO",
        }
    }

    /// Position of this flag inside a [`CpuFeatures`](super::CpuFeatures) bitset.
    pub(crate) const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Flags this one can never be reported without.
    ///
    /// The probe guarantees `supports(self) ⇒ supports(dep)` for each entry.
    #[must_use]
    pub const fn implies(self) -> &'static [FeatureFlag] {
        match self {
            Self::Avx2 => &[Self::Avx],
            Self::VaesAvx2 | Self::Sha512 if cfg!(any(target_arch = "x86", target_arch = "x86_64")) => {
                &[Self::Avx2, Self::Avx]
            }
            _ => &[],
        }
    }
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
