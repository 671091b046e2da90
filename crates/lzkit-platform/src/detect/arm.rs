//! # ARM / AArch64 Feature Probe
//!
//! ARM user space cannot read the ID registers portably, so every answer
//! comes from the OS:
//!
//! | OS | Source |
//! |----|--------|
//! | Windows | `IsProcessorFeaturePresent` |
//! | Linux / Android | `getauxval(AT_HWCAP)`, plus `AT_HWCAP2` on 32-bit |
//! | FreeBSD | `elf_aux_info` with the same masks |
//! | macOS / iOS | `sysctlbyname("hw.optional.*")` |
//!
//! The decoders below are pure functions over the OS answers so that they
//! can be tested on any host.

#![cfg_attr(not(any(target_arch = "arm", target_arch = "aarch64")), allow(dead_code))]

use super::FeatureFlag;

/// `AT_HWCAP` bits on AArch64 Linux / FreeBSD.
pub(crate) mod hwcap64 {
    pub const AES: u64 = 1 << 3;
    pub const SHA1: u64 = 1 << 5;
    pub const SHA2: u64 = 1 << 6;
    pub const CRC32: u64 = 1 << 7;
    pub const SHA512: u64 = 1 << 21;
}

/// `AT_HWCAP` / `AT_HWCAP2` bits on 32-bit ARM Linux / FreeBSD.
pub(crate) mod hwcap32 {
    pub const NEON: u64 = 1 << 12;
    pub const AES: u64 = 1 << 0;
    pub const SHA1: u64 = 1 << 2;
    pub const SHA2: u64 = 1 << 3;
    pub const CRC32: u64 = 1 << 4;
}

/// Windows `PF_ARM_*` processor feature numbers.
pub(crate) mod pf {
    pub const NEON_INSTRUCTIONS_AVAILABLE: u32 = 19;
    pub const V8_CRYPTO_INSTRUCTIONS_AVAILABLE: u32 = 30;
    pub const V8_CRC32_INSTRUCTIONS_AVAILABLE: u32 = 31;
}

/// Apple `sysctl` keys.
pub(crate) mod sysctl_key {
    pub const NEON: &str = "hw.optional.neon";
    pub const CRC32: &str = "hw.optional.armv8_crc32";
    pub const SHA512: &str = "hw.optional.armv8_2_sha512";
}

/// Kernel capability masks. A mask the kernel did not supply is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HwCaps {
    pub hwcap: u64,
    pub hwcap2: u64,
}

#[inline]
const fn has(mask: u64, bits: u64) -> bool {
    mask & bits != 0
}

const fn is_x86_only(flag: FeatureFlag) -> bool {
    matches!(
        flag,
        FeatureFlag::Cmov
            | FeatureFlag::Sse
            | FeatureFlag::Sse2
            | FeatureFlag::Ssse3
            | FeatureFlag::Sse41
            | FeatureFlag::Sha
            | FeatureFlag::Avx
            | FeatureFlag::Avx2
            | FeatureFlag::VaesAvx2
            | FeatureFlag::PageGb
    )
}

/// AArch64 on Linux, Android or FreeBSD. NEON is architecturally mandatory.
pub(crate) fn decode_aarch64(caps: HwCaps, flag: FeatureFlag) -> bool {
    let hw = caps.hwcap;
    match flag {
        FeatureFlag::Neon => true,
        FeatureFlag::Aes => has(hw, hwcap64::AES),
        FeatureFlag::Sha1 => has(hw, hwcap64::SHA1),
        FeatureFlag::Sha2 => has(hw, hwcap64::SHA2),
        FeatureFlag::Crc32 => has(hw, hwcap64::CRC32),
        FeatureFlag::Sha512 => has(hw, hwcap64::SHA512),
        FeatureFlag::Crypto => {
            has(hw, hwcap64::AES) && has(hw, hwcap64::SHA1) && has(hw, hwcap64::SHA2)
        }
        _ => false,
    }
}

/// 32-bit ARM on Linux, Android or FreeBSD.
///
/// NEON lives in the primary mask; the ARMv8 crypto and CRC bits moved to
/// the secondary one.
pub(crate) fn decode_arm32(caps: HwCaps, flag: FeatureFlag) -> bool {
    let hw2 = caps.hwcap2;
    match flag {
        FeatureFlag::Neon => has(caps.hwcap, hwcap32::NEON),
        FeatureFlag::Aes => has(hw2, hwcap32::AES),
        FeatureFlag::Sha1 => has(hw2, hwcap32::SHA1),
        FeatureFlag::Sha2 => has(hw2, hwcap32::SHA2),
        FeatureFlag::Crc32 => has(hw2, hwcap32::CRC32),
        FeatureFlag::Crypto => {
            has(hw2, hwcap32::AES) && has(hw2, hwcap32::SHA1) && has(hw2, hwcap32::SHA2)
        }
        _ => false,
    }
}

/// Windows on ARM. Only a single crypto flag exists, so AES and both SHA
/// variants share it. SHA-512 cannot be queried.
pub(crate) fn decode_windows<F>(present: F, flag: FeatureFlag) -> bool
where
    F: Fn(u32) -> bool,
{
    match flag {
        FeatureFlag::Neon => present(pf::NEON_INSTRUCTIONS_AVAILABLE),
        FeatureFlag::Crc32 => present(pf::V8_CRC32_INSTRUCTIONS_AVAILABLE),
        FeatureFlag::Crypto | FeatureFlag::Aes | FeatureFlag::Sha1 | FeatureFlag::Sha2 => {
            present(pf::V8_CRYPTO_INSTRUCTIONS_AVAILABLE)
        }
        _ => false,
    }
}

/// Apple platforms. Every arm64 Apple core has NEON, AES, SHA-1 and SHA-256.
///
/// `sysctl` returns the integer value of a key, or `None` when the key is
/// missing. Only a value of exactly 1 counts as present.
pub(crate) fn decode_apple<F>(arm64: bool, sysctl: F, flag: FeatureFlag) -> bool
where
    F: Fn(&str) -> Option<u32>,
{
    let enabled = |key: &str| sysctl(key) == Some(1);
    match flag {
        FeatureFlag::Neon => arm64 || enabled(sysctl_key::NEON),
        FeatureFlag::Crc32 => enabled(sysctl_key::CRC32),
        FeatureFlag::Sha512 => enabled(sysctl_key::SHA512),
        FeatureFlag::Aes | FeatureFlag::Sha1 | FeatureFlag::Sha2 | FeatureFlag::Crypto => arm64,
        _ => false,
    }
}

/// Answer `flag` for the running ARM processor.
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub(crate) fn probe(flag: FeatureFlag) -> bool {
    if is_x86_only(flag) {
        return false;
    }
    native::probe(flag)
}

#[cfg(all(any(target_arch = "arm", target_arch = "aarch64"), windows))]
mod native {
    use super::{decode_windows, FeatureFlag};

    #[allow(unsafe_code)]
    pub(super) fn probe(flag: FeatureFlag) -> bool {
        decode_windows(
            // SAFETY: plain query with no pointer arguments.
            |id| unsafe { winapi::um::processthreadsapi::IsProcessorFeaturePresent(id) != 0 },
            flag,
        )
    }
}

#[cfg(all(
    any(target_arch = "arm", target_arch = "aarch64"),
    any(target_os = "linux", target_os = "android", target_os = "freebsd")
))]
mod native {
    use super::{FeatureFlag, HwCaps};

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const AT_HWCAP: libc::c_ulong = 16;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const AT_HWCAP2: libc::c_ulong = 26;

    #[cfg(target_os = "freebsd")]
    const AT_HWCAP: libc::c_int = 25;
    #[cfg(target_os = "freebsd")]
    const AT_HWCAP2: libc::c_int = 26;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[allow(unsafe_code)]
    fn auxval(key: libc::c_ulong) -> u64 {
        // SAFETY: getauxval only reads the process auxiliary vector and
        // returns 0 for unknown keys.
        u64::from(unsafe { libc::getauxval(key) })
    }

    #[cfg(target_os = "freebsd")]
    #[allow(unsafe_code)]
    fn auxval(key: libc::c_int) -> u64 {
        let mut value: libc::c_ulong = 0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let len = std::mem::size_of::<libc::c_ulong>() as libc::c_int;
        // SAFETY: `value` is a valid, writable buffer of exactly `len` bytes.
        let rc = unsafe { libc::elf_aux_info(key, std::ptr::addr_of_mut!(value).cast(), len) };
        if rc == 0 {
            u64::from(value)
        } else {
            0
        }
    }

    fn read_caps() -> HwCaps {
        HwCaps {
            hwcap: auxval(AT_HWCAP),
            hwcap2: if cfg!(target_arch = "arm") { auxval(AT_HWCAP2) } else { 0 },
        }
    }

    pub(super) fn probe(flag: FeatureFlag) -> bool {
        let caps = read_caps();
        #[cfg(target_arch = "aarch64")]
        {
            super::decode_aarch64(caps, flag)
        }
        #[cfg(target_arch = "arm")]
        {
            super::decode_arm32(caps, flag)
        }
    }
}

#[cfg(all(any(target_arch = "arm", target_arch = "aarch64"), target_vendor = "apple"))]
mod native {
    use super::{decode_apple, FeatureFlag};
    use std::ffi::CString;

    /// Read an integer `sysctl` value. A result that is not exactly four
    /// bytes is treated as a failure.
    #[allow(unsafe_code)]
    pub(crate) fn sysctl_u32(name: &str) -> Option<u32> {
        let name = CString::new(name).ok()?;
        let mut value: u32 = 0;
        let mut len = std::mem::size_of::<u32>();
        // SAFETY: `value` is writable for `len` bytes and `name` is a valid
        // NUL-terminated string; no new value is written.
        let rc = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                std::ptr::addr_of_mut!(value).cast(),
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        (rc == 0 && len == std::mem::size_of::<u32>()).then_some(value)
    }

    pub(super) fn probe(flag: FeatureFlag) -> bool {
        decode_apple(cfg!(target_arch = "aarch64"), sysctl_u32, flag)
    }
}

/// No OS query available: only what the compile target guarantees.
#[cfg(all(
    any(target_arch = "arm", target_arch = "aarch64"),
    not(any(
        windows,
        target_vendor = "apple",
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd"
    ))
))]
mod native {
    use super::FeatureFlag;

    pub(super) fn probe(flag: FeatureFlag) -> bool {
        matches!(flag, FeatureFlag::Neon) && cfg!(target_feature = "neon")
    }
}
