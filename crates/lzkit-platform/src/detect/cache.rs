//! Cache line size.

/// Fallback when neither sysfs nor CPUID reports a line size.
pub const DEFAULT_CACHE_LINE: usize = 64;

/// Detect the cache line size of the running processor.
///
/// Returns 64 bytes as the default, which is correct for most modern processors.
#[must_use]
pub fn cache_line_size() -> usize {
    detect_cache_line_size().unwrap_or(DEFAULT_CACHE_LINE)
}

fn detect_cache_line_size() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        if let Some(size) = detect_cache_line_sysfs() {
            return Some(size);
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if let Some(size) = detect_cache_line_cpuid(&super::x86::NativeCpuid) {
            return Some(size);
        }
    }

    None
}

/// L1 data, L1 instruction, then L2.
#[cfg(target_os = "linux")]
fn detect_cache_line_sysfs() -> Option<usize> {
    const PATHS: [&str; 3] = [
        "/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size",
        "/sys/devices/system/cpu/cpu0/cache/index1/coherency_line_size",
        "/sys/devices/system/cpu/cpu0/cache/index2/coherency_line_size",
    ];

    PATHS
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .find_map(|content| parse_line_size(&content))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_line_size(content: &str) -> Option<usize> {
    content
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|size| size.is_power_of_two())
}

/// CPUID leaf 0x8000_0006 ECX\[7:0\]: L2 line size in bytes.
#[cfg_attr(not(any(target_arch = "x86", target_arch = "x86_64")), allow(dead_code))]
fn detect_cache_line_cpuid<S: super::x86::CpuidSource + ?Sized>(src: &S) -> Option<usize> {
    const LEAF_L2: u32 = 0x8000_0006;

    if !src.cpuid_available() || src.cpuid(0x8000_0000, 0).eax < LEAF_L2 {
        return None;
    }
    let line = (src.cpuid(LEAF_L2, 0).ecx & 0xFF) as usize;
    (line > 0).then_some(line)
}
