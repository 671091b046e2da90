//! # x86 / x86\_64 Feature Probe
//!
//! Decodes CPUID and XCR0 into [`FeatureFlag`] answers.
//!
//! The decision logic is written against [`CpuidSource`] so the same code
//! runs against the real processor ([`NativeCpuid`]) and against synthetic
//! register files in tests. Bit positions follow the Intel SDM / AMD APM
//! layout and must not be changed.
//!
//! ## AVX
//!
//! AVX is only reported when all three of these hold:
//!
//! 1. the OS reports XSAVE as enabled (Windows `PF_XSAVE_ENABLED`; no such
//!    query exists elsewhere),
//! 2. CPUID.1:ECX has both AVX (bit 28) and OSXSAVE (bit 27),
//! 3. XCR0 has SSE (bit 1) and AVX (bit 2) state enabled.
//!
//! Anything less risks YMM state being lost across context switches.

#![cfg_attr(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    allow(dead_code)
)]

use super::FeatureFlag;

/// Leaf 1 EDX.
const EDX1_CMOV: u32 = 15;
const EDX1_SSE: u32 = 25;
const EDX1_SSE2: u32 = 26;

/// Leaf 1 ECX.
const ECX1_SSSE3: u32 = 9;
const ECX1_SSE41: u32 = 19;
const ECX1_AES: u32 = 25;
const ECX1_OSXSAVE: u32 = 27;
const ECX1_AVX: u32 = 28;

/// Leaf 7 subleaf 0.
const EBX7_AVX2: u32 = 5;
const EBX7_SHA: u32 = 29;
const ECX7_VAES: u32 = 9;

/// Leaf 7 subleaf 1 EAX.
const EAX7_1_SHA512: u32 = 0;

/// Extended leaves.
const LEAF_EXT_MAX: u32 = 0x8000_0000;
const LEAF_EXT_FEATURES: u32 = 0x8000_0001;
const EDX_EXT_PAGE1GB: u32 = 26;

/// XCR0 state components.
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

/// Output registers of one CPUID invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[inline]
const fn bit(reg: u32, n: u32) -> bool {
    (reg >> n) & 1 != 0
}

/// Everything the decoder needs from the processor and OS.
pub(crate) trait CpuidSource {
    /// Whether the CPUID instruction exists. Always true on x86\_64.
    fn cpuid_available(&self) -> bool;

    /// Execute CPUID with the given leaf and subleaf.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers;

    /// Read XCR0. Only called after OSXSAVE has been confirmed.
    fn xcr0(&self) -> u64;

    /// OS-reported XSAVE processor feature. True where the OS has no such query.
    fn os_xsave_enabled(&self) -> bool;

    /// The OS saves SSE registers across context switches.
    fn os_sse_enabled(&self) -> bool;

    /// CMOV, SSE and SSE2 are part of the architectural baseline (x86\_64).
    fn sse2_baseline(&self) -> bool;
}

/// Answer `flag` for the processor described by `src`.
pub(crate) fn probe<S: CpuidSource + ?Sized>(src: &S, flag: FeatureFlag) -> bool {
    match flag {
        FeatureFlag::Cmov => src.sse2_baseline() || leaf1(src).is_some_and(|r| bit(r.edx, EDX1_CMOV)),
        FeatureFlag::Sse => sse_edx_bit(src, EDX1_SSE),
        FeatureFlag::Sse2 => sse_edx_bit(src, EDX1_SSE2),
        FeatureFlag::Ssse3 => bit(leaf1_ecx(src), ECX1_SSSE3),
        FeatureFlag::Sse41 => bit(leaf1_ecx(src), ECX1_SSE41),
        FeatureFlag::Aes => bit(leaf1_ecx(src), ECX1_AES),
        FeatureFlag::Sha => src.os_sse_enabled() && leaf7(src, 0).is_some_and(|r| bit(r.ebx, EBX7_SHA)),
        FeatureFlag::Sha512 => sha512(src),
        FeatureFlag::Avx => avx(src),
        FeatureFlag::Avx2 => avx2(src),
        FeatureFlag::VaesAvx2 => vaes_avx2(src),
        FeatureFlag::PageGb => page_1gb(src),
        FeatureFlag::Neon
        | FeatureFlag::Crc32
        | FeatureFlag::Sha1
        | FeatureFlag::Sha2
        | FeatureFlag::Crypto => false,
    }
}

/// Highest basic leaf, or 0 when CPUID is unavailable.
fn max_leaf<S: CpuidSource + ?Sized>(src: &S) -> u32 {
    if src.cpuid_available() {
        src.cpuid(0, 0).eax
    } else {
        0
    }
}

fn leaf1<S: CpuidSource + ?Sized>(src: &S) -> Option<Registers> {
    (max_leaf(src) >= 1).then(|| src.cpuid(1, 0))
}

fn leaf7<S: CpuidSource + ?Sized>(src: &S, subleaf: u32) -> Option<Registers> {
    (max_leaf(src) >= 7).then(|| src.cpuid(7, subleaf))
}

/// Leaf 1 ECX, or 0 when the OS cannot be trusted with SSE state.
fn leaf1_ecx<S: CpuidSource + ?Sized>(src: &S) -> u32 {
    if !src.os_sse_enabled() {
        return 0;
    }
    leaf1(src).map_or(0, |r| r.ecx)
}

fn sse_edx_bit<S: CpuidSource + ?Sized>(src: &S, n: u32) -> bool {
    if src.sse2_baseline() {
        return true;
    }
    src.os_sse_enabled() && leaf1(src).is_some_and(|r| bit(r.edx, n))
}

fn avx<S: CpuidSource + ?Sized>(src: &S) -> bool {
    if !src.os_xsave_enabled() {
        return false;
    }

    let ecx = leaf1_ecx(src);
    if !(bit(ecx, ECX1_AVX) && bit(ecx, ECX1_OSXSAVE)) {
        return false;
    }

    // OSXSAVE is set, so XGETBV will not fault.
    let xcr0 = src.xcr0();
    xcr0 & (XCR0_SSE | XCR0_AVX) == (XCR0_SSE | XCR0_AVX)
}

fn avx2<S: CpuidSource + ?Sized>(src: &S) -> bool {
    avx(src) && leaf7(src, 0).is_some_and(|r| bit(r.ebx, EBX7_AVX2))
}

fn vaes_avx2<S: CpuidSource + ?Sized>(src: &S) -> bool {
    avx(src) && leaf7(src, 0).is_some_and(|r| bit(r.ebx, EBX7_AVX2) && bit(r.ecx, ECX7_VAES))
}

fn sha512<S: CpuidSource + ?Sized>(src: &S) -> bool {
    if !avx2(src) {
        return false;
    }
    // Subleaf 0 EAX reports the highest valid subleaf.
    match leaf7(src, 0) {
        Some(r) if r.eax >= 1 => bit(src.cpuid(7, 1).eax, EAX7_1_SHA512),
        _ => false,
    }
}

fn page_1gb<S: CpuidSource + ?Sized>(src: &S) -> bool {
    if !src.cpuid_available() {
        return false;
    }
    if src.cpuid(LEAF_EXT_MAX, 0).eax < LEAF_EXT_FEATURES {
        return false;
    }
    bit(src.cpuid(LEAF_EXT_FEATURES, 0).edx, EDX_EXT_PAGE1GB)
}

/// The running processor.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NativeCpuid;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl CpuidSource for NativeCpuid {
    #[cfg(target_arch = "x86_64")]
    fn cpuid_available(&self) -> bool {
        true
    }

    /// Toggle EFLAGS.ID (bit 21) and check that the change sticks.
    #[cfg(target_arch = "x86")]
    #[allow(unsafe_code)]
    fn cpuid_available(&self) -> bool {
        let changed: u32;
        // SAFETY: only EFLAGS and the stack are touched; the saved EFLAGS
        // value is restored before the block ends.
        unsafe {
            std::arch::asm!(
                "pushfd",
                "pushfd",
                "pop {a}",
                "btc {a}, 21",
                "push {a}",
                "popfd",
                "pushfd",
                "pop {a}",
                "xor {a}, [esp]",
                "popfd",
                a = out(reg) changed,
            );
        }
        bit(changed, 21)
    }

    #[allow(unsafe_code)]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::__cpuid_count;
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::__cpuid_count;

        // SAFETY: CPUID is unprivileged; on 32-bit targets callers check
        // cpuid_available() first.
        let r = unsafe { __cpuid_count(leaf, subleaf) };
        Registers {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }

    #[allow(unsafe_code)]
    fn xcr0(&self) -> u64 {
        let (lo, hi): (u32, u32);
        // SAFETY: XGETBV is valid once CPUID.1:ECX.OSXSAVE is set, which the
        // decoder checks before calling this.
        unsafe {
            std::arch::asm!(
                "xgetbv",
                in("ecx") 0u32,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags),
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }

    #[cfg(windows)]
    #[allow(unsafe_code)]
    fn os_xsave_enabled(&self) -> bool {
        const PF_XSAVE_ENABLED: u32 = 17;
        // SAFETY: plain query with no pointer arguments.
        unsafe { winapi::um::processthreadsapi::IsProcessorFeaturePresent(PF_XSAVE_ENABLED) != 0 }
    }

    #[cfg(not(windows))]
    fn os_xsave_enabled(&self) -> bool {
        true
    }

    /// There is no user-space way to ask whether a 32-bit OS preserves XMM
    /// registers, so on 32-bit Windows this infers it from the OS version:
    /// Windows 2000 (major 5) and later do. The heuristic only matters on
    /// that target.
    #[cfg(all(target_arch = "x86", windows))]
    #[allow(unsafe_code)]
    fn os_sse_enabled(&self) -> bool {
        // SAFETY: plain query with no arguments.
        let version = unsafe { winapi::um::sysinfoapi::GetVersion() };
        #[allow(clippy::cast_possible_truncation)]
        let major = version as u8;
        let enabled = major >= 5;
        if !enabled {
            tracing::debug!(major, "OS version predates SSE state saving; SSE reported unavailable");
        }
        enabled
    }

    #[cfg(not(all(target_arch = "x86", windows)))]
    fn os_sse_enabled(&self) -> bool {
        true
    }

    fn sse2_baseline(&self) -> bool {
        cfg!(target_arch = "x86_64")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Synthetic register file.
    #[derive(Debug, Clone, Default)]
    struct FakeCpuid {
        available: bool,
        leaves: HashMap<(u32, u32), Registers>,
        xcr0: u64,
        os_xsave: bool,
        os_sse: bool,
        baseline: bool,
    }

    impl FakeCpuid {
        /// A 32-bit-style CPU with every probed feature present.
        fn modern() -> Self {
            let mut leaves = HashMap::new();
            leaves.insert((0, 0), Registers { eax: 7, ..Registers::default() });
            leaves.insert(
                (1, 0),
                Registers {
                    ecx: (1 << ECX1_SSSE3)
                        | (1 << ECX1_SSE41)
                        | (1 << ECX1_AES)
                        | (1 << ECX1_OSXSAVE)
                        | (1 << ECX1_AVX),
                    edx: (1 << EDX1_CMOV) | (1 << EDX1_SSE) | (1 << EDX1_SSE2),
                    ..Registers::default()
                },
            );
            leaves.insert(
                (7, 0),
                Registers {
                    eax: 1,
                    ebx: (1 << EBX7_AVX2) | (1 << EBX7_SHA),
                    ecx: 1 << ECX7_VAES,
                    ..Registers::default()
                },
            );
            leaves.insert((7, 1), Registers { eax: 1, ..Registers::default() });
            leaves.insert(
                (LEAF_EXT_MAX, 0),
                Registers { eax: LEAF_EXT_FEATURES, ..Registers::default() },
            );
            leaves.insert(
                (LEAF_EXT_FEATURES, 0),
                Registers { edx: 1 << EDX_EXT_PAGE1GB, ..Registers::default() },
            );
            Self {
                available: true,
                leaves,
                xcr0: 0b111,
                os_xsave: true,
                os_sse: true,
                baseline: false,
            }
        }

        fn clear(mut self, leaf: u32, subleaf: u32, f: impl FnOnce(&mut Registers)) -> Self {
            f(self.leaves.entry((leaf, subleaf)).or_default());
            self
        }
    }

    impl CpuidSource for FakeCpuid {
        fn cpuid_available(&self) -> bool {
            self.available
        }
        fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers {
            assert!(self.available, "cpuid executed on a CPU without it");
            self.leaves.get(&(leaf, subleaf)).copied().unwrap_or_default()
        }
        fn xcr0(&self) -> u64 {
            let ecx = self.leaves.get(&(1, 0)).map_or(0, |r| r.ecx);
            assert!(bit(ecx, ECX1_OSXSAVE), "xgetbv executed without OSXSAVE");
            self.xcr0
        }
        fn os_xsave_enabled(&self) -> bool {
            self.os_xsave
        }
        fn os_sse_enabled(&self) -> bool {
            self.os_sse
        }
        fn sse2_baseline(&self) -> bool {
            self.baseline
        }
    }

    fn all(src: &FakeCpuid) -> Vec<FeatureFlag> {
        FeatureFlag::ALL.into_iter().filter(|&f| probe(src, f)).collect()
    }

    #[test]
    fn test_modern_cpu_reports_every_x86_flag() {
        let cpu = FakeCpuid::modern();
        for flag in [
            FeatureFlag::Cmov,
            FeatureFlag::Sse,
            FeatureFlag::Sse2,
            FeatureFlag::Ssse3,
            FeatureFlag::Sse41,
            FeatureFlag::Aes,
            FeatureFlag::Sha,
            FeatureFlag::Sha512,
            FeatureFlag::Avx,
            FeatureFlag::Avx2,
            FeatureFlag::VaesAvx2,
            FeatureFlag::PageGb,
        ] {
            assert!(probe(&cpu, flag), "{flag} should be reported");
        }
        for flag in [FeatureFlag::Neon, FeatureFlag::Crc32, FeatureFlag::Crypto] {
            assert!(!probe(&cpu, flag));
        }
    }

    #[test]
    fn test_no_cpuid_reports_nothing() {
        let cpu = FakeCpuid {
            available: false,
            ..FakeCpuid::modern()
        };
        assert!(all(&cpu).is_empty());
    }

    #[test]
    fn test_baseline_without_cpuid_bits() {
        let cpu = FakeCpuid {
            baseline: true,
            ..FakeCpuid::default()
        };
        assert_eq!(
            all(&cpu),
            vec![FeatureFlag::Cmov, FeatureFlag::Sse, FeatureFlag::Sse2]
        );
    }

    #[test]
    fn test_avx_requires_os_flag() {
        let cpu = FakeCpuid {
            os_xsave: false,
            ..FakeCpuid::modern()
        };
        assert!(!probe(&cpu, FeatureFlag::Avx));
        assert!(!probe(&cpu, FeatureFlag::Avx2));
        assert!(!probe(&cpu, FeatureFlag::Sha512));
        assert!(probe(&cpu, FeatureFlag::Aes));
    }

    #[test]
    fn test_avx_requires_osxsave_bit() {
        let cpu = FakeCpuid::modern().clear(1, 0, |r| r.ecx &= !(1 << ECX1_OSXSAVE));
        // xcr0() asserts if it gets called here.
        assert!(!probe(&cpu, FeatureFlag::Avx));
        assert!(!probe(&cpu, FeatureFlag::VaesAvx2));
    }

    #[test]
    fn test_avx_requires_hardware_bit() {
        let cpu = FakeCpuid::modern().clear(1, 0, |r| r.ecx &= !(1 << ECX1_AVX));
        assert!(!probe(&cpu, FeatureFlag::Avx));
    }

    #[test]
    fn test_avx_requires_ymm_state_in_xcr0() {
        for xcr0 in [0b001, 0b011, 0b101] {
            let cpu = FakeCpuid {
                xcr0,
                ..FakeCpuid::modern()
            };
            assert!(!probe(&cpu, FeatureFlag::Avx), "xcr0={xcr0:#b}");
            assert!(!probe(&cpu, FeatureFlag::Avx2), "xcr0={xcr0:#b}");
        }
    }

    #[test]
    fn test_os_sse_gate() {
        let cpu = FakeCpuid {
            os_sse: false,
            ..FakeCpuid::modern()
        };
        assert!(probe(&cpu, FeatureFlag::Cmov));
        for flag in [
            FeatureFlag::Sse,
            FeatureFlag::Sse2,
            FeatureFlag::Ssse3,
            FeatureFlag::Sse41,
            FeatureFlag::Aes,
            FeatureFlag::Sha,
            FeatureFlag::Avx,
        ] {
            assert!(!probe(&cpu, flag), "{flag} must depend on OS SSE support");
        }
    }

    #[test]
    fn test_leaf7_requires_max_leaf() {
        let cpu = FakeCpuid::modern().clear(0, 0, |r| r.eax = 6);
        assert!(probe(&cpu, FeatureFlag::Avx));
        assert!(!probe(&cpu, FeatureFlag::Avx2));
        assert!(!probe(&cpu, FeatureFlag::Sha));
        assert!(!probe(&cpu, FeatureFlag::VaesAvx2));
    }

    #[test]
    fn test_vaes_needs_both_bits() {
        let no_vaes = FakeCpuid::modern().clear(7, 0, |r| r.ecx = 0);
        assert!(probe(&no_vaes, FeatureFlag::Avx2));
        assert!(!probe(&no_vaes, FeatureFlag::VaesAvx2));

        let no_avx2 = FakeCpuid::modern().clear(7, 0, |r| r.ebx &= !(1 << EBX7_AVX2));
        assert!(!probe(&no_avx2, FeatureFlag::VaesAvx2));
    }

    #[test]
    fn test_sha512_needs_subleaf_count() {
        let cpu = FakeCpuid::modern().clear(7, 0, |r| r.eax = 0);
        assert!(probe(&cpu, FeatureFlag::Avx2));
        assert!(!probe(&cpu, FeatureFlag::Sha512));

        let cpu = FakeCpuid::modern().clear(7, 1, |r| r.eax = 0);
        assert!(!probe(&cpu, FeatureFlag::Sha512));
    }

    #[test]
    fn test_page_1gb_needs_extended_range() {
        let cpu = FakeCpuid::modern().clear(LEAF_EXT_MAX, 0, |r| r.eax = LEAF_EXT_MAX);
        assert!(!probe(&cpu, FeatureFlag::PageGb));
    }

    fn arb_registers() -> impl Strategy<Value = Registers> {
        (any::<u32>(), any::<u32>(), any::<u32>(), any::<u32>())
            .prop_map(|(eax, ebx, ecx, edx)| Registers { eax, ebx, ecx, edx })
    }

    proptest! {
        #[test]
        fn prop_implications_hold(
            max in 0u32..12,
            l1 in arb_registers(),
            l7 in arb_registers(),
            l7_1 in arb_registers(),
            xcr0 in any::<u64>(),
            os_xsave in any::<bool>(),
            os_sse in any::<bool>(),
        ) {
            let mut leaves = HashMap::new();
            leaves.insert((0, 0), Registers { eax: max, ..Registers::default() });
            leaves.insert((1, 0), l1);
            leaves.insert((7, 0), l7);
            leaves.insert((7, 1), l7_1);
            let cpu = FakeCpuid {
                available: true,
                leaves,
                xcr0,
                os_xsave,
                os_sse,
                baseline: false,
            };

            for flag in FeatureFlag::ALL {
                if probe(&cpu, flag) {
                    for &dep in flag.implies() {
                        prop_assert!(probe(&cpu, dep), "{} without {}", flag, dep);
                    }
                }
            }
            if probe(&cpu, FeatureFlag::Sha512) || probe(&cpu, FeatureFlag::VaesAvx2) {
                prop_assert!(probe(&cpu, FeatureFlag::Avx2));
            }
            if probe(&cpu, FeatureFlag::Avx2) {
                prop_assert!(probe(&cpu, FeatureFlag::Avx));
            }
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn test_native_matches_std_detection() {
        let cpu = NativeCpuid;
        // std performs the same OS-state checks for AVX.
        if probe(&cpu, FeatureFlag::Avx2) {
            assert!(std::arch::is_x86_feature_detected!("avx2"));
        }
        if probe(&cpu, FeatureFlag::Aes) {
            assert!(std::arch::is_x86_feature_detected!("aes"));
        }
        if probe(&cpu, FeatureFlag::Sse41) {
            assert!(std::arch::is_x86_feature_detected!("sse4.1"));
        }
    }
}
