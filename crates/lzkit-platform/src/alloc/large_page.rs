//! Process-wide large page size.
//!
//! Probed once from the OS and fixed for the rest of the process. A zero
//! size disables every large-page path.

use std::sync::OnceLock;

/// Largest large page the big allocator will round requests up to.
pub const MAX_LARGE_PAGE: usize = 1 << 30;

static LARGE_PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Probe the large page size now if it has not been probed yet.
///
/// Calling this at startup keeps the OS query off the first big allocation.
/// Returns the size, `0` when unavailable.
pub fn init() -> usize {
    large_page_size()
}

/// The process-wide large page size, `0` when unavailable.
///
/// Safe to call from any number of threads; the OS is queried exactly once.
#[must_use]
pub fn large_page_size() -> usize {
    *LARGE_PAGE_SIZE.get_or_init(|| {
        let raw = os_large_page_size();
        let size = sanitize(raw);
        tracing::debug!(raw, size, "large page size probed");
        size
    })
}

/// Zero or a non-power-of-two size means unavailable.
pub(crate) const fn sanitize(raw: usize) -> usize {
    if raw.is_power_of_two() {
        raw
    } else {
        0
    }
}

/// Length to request from the large-page path for a `size`-byte block, or
/// `None` when the plain page path should be used.
///
/// Large pages are tried when the page size `page` is known, at most
/// [`MAX_LARGE_PAGE`], and `size` is more than half a page. The request is
/// rounded up to a whole number of pages; overflow skips the path.
pub(crate) const fn large_page_len(size: usize, page: usize) -> Option<usize> {
    if page == 0 || page > MAX_LARGE_PAGE || size <= page / 2 {
        return None;
    }
    let mask = page - 1;
    match size.checked_add(mask) {
        Some(padded) => Some(padded & !mask),
        None => None,
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn os_large_page_size() -> usize {
    // SAFETY: plain query with no arguments.
    unsafe { winapi::um::memoryapi::GetLargePageMinimum() }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn os_large_page_size() -> usize {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_hugepagesize(&meminfo))
        .unwrap_or(0)
}

#[cfg(not(any(windows, target_os = "linux", target_os = "android")))]
fn os_large_page_size() -> usize {
    0
}

/// `Hugepagesize:    2048 kB` from `/proc/meminfo`, in bytes.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn parse_hugepagesize(meminfo: &str) -> Option<usize> {
    meminfo.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()?.trim_end_matches(':') != "Hugepagesize" {
            return None;
        }
        let kib: usize = parts.next()?.parse().ok()?;
        kib.checked_mul(1024)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:       32594848 kB
MemFree:        10238476 kB
HugePages_Total:       0
HugePages_Free:        0
Hugepagesize:       2048 kB
Hugetlb:               0 kB
";

    #[test]
    fn test_parse_hugepagesize() {
        assert_eq!(parse_hugepagesize(MEMINFO), Some(2 * 1024 * 1024));
        assert_eq!(parse_hugepagesize("MemTotal: 1 kB\n"), None);
        assert_eq!(parse_hugepagesize("Hugepagesize: lots kB\n"), None);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(0), 0);
        assert_eq!(sanitize(3 << 20), 0);
        assert_eq!(sanitize(2 << 20), 2 << 20);
    }

    #[test]
    fn test_large_page_len() {
        const PS: usize = 2 << 20;

        assert_eq!(large_page_len(1_000_000, 0), None);
        assert_eq!(large_page_len(PS / 2, PS), None);
        assert_eq!(large_page_len(PS / 2 + 1, PS), Some(PS));
        assert_eq!(large_page_len(PS + 1, PS), Some(2 * PS));
        assert_eq!(large_page_len(4 * PS, PS), Some(4 * PS));
        assert_eq!(large_page_len(usize::MAX - 10, PS), None);
        assert_eq!(large_page_len(usize::MAX, 2 * MAX_LARGE_PAGE), None);
    }

    #[test]
    fn test_probe_is_stable() {
        let first = init();
        assert_eq!(first, large_page_size());
        assert!(first == 0 || first.is_power_of_two());
    }
}
