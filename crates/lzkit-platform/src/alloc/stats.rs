//! Debug-mode allocation counters.
//!
//! Each allocator instance owns its counters. They are only touched when the
//! instance was built with debug mode on, and never change whether a request
//! succeeds.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Event label in the debug trace stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Heap allocation.
    Alloc,
    /// Heap reallocation.
    Realloc,
    /// Whole-page allocation.
    AllocMid,
    /// Request entering the big page allocator.
    AllocBig,
    /// Big request served by large pages.
    AllocBigLarge,
    /// Heap free.
    Free,
    /// Whole-page free.
    FreeMid,
    /// Free through the big page allocator.
    FreeBig,
}

impl AllocKind {
    /// Fixed label written to the trace stream.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Alloc => "Alloc",
            Self::Realloc => "Realloc",
            Self::AllocMid => "Alloc-Mid",
            Self::AllocBig => "Alloc-Big",
            Self::AllocBigLarge => "Alloc-BM",
            Self::Free => "Free",
            Self::FreeMid => "Free-Mid",
            Self::FreeBig => "Free-Big",
        }
    }
}

impl std::fmt::Display for AllocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Counter values at one point in time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    /// Blocks handed out and not yet freed
    pub live: i64,
    /// Successful allocations
    pub allocations: u64,
    /// Frees of non-null pointers
    pub frees: u64,
    /// Bytes requested by successful allocations
    pub bytes_allocated: u64,
}

impl AllocationStats {
    /// Whether every allocation has been freed.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.live == 0
    }
}

/// Per-instance counters.
#[derive(Debug, Default)]
pub(crate) struct DebugCounters {
    enabled: bool,
    live: AtomicI64,
    allocations: AtomicU64,
    frees: AtomicU64,
    bytes: AtomicU64,
}

impl DebugCounters {
    pub(crate) const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            live: AtomicI64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub(crate) const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count a block handed to the caller.
    pub(crate) fn on_alloc(&self, kind: AllocKind, size: usize, ptr: *const u8) {
        if !self.enabled {
            return;
        }
        let count = self.live.fetch_add(1, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        tracing::trace!(kind = kind.label(), count, size, addr = ?ptr, "alloc");
    }

    /// Count a block returned by the caller. Null pointers are not counted.
    pub(crate) fn on_free(&self, kind: AllocKind, ptr: *const u8) {
        if !self.enabled || ptr.is_null() {
            return;
        }
        let count = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
        self.frees.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kind = kind.label(), count, addr = ?ptr, "free");
    }

    /// Count a successful reallocation. Only a reallocation of null creates a
    /// new live block.
    pub(crate) fn on_realloc(&self, old: *const u8, size: usize, new: *const u8) {
        if !self.enabled {
            return;
        }
        let count = if old.is_null() {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            self.live.fetch_add(1, Ordering::Relaxed)
        } else {
            self.live.load(Ordering::Relaxed)
        };
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        tracing::trace!(kind = AllocKind::Realloc.label(), count, size, old = ?old, addr = ?new, "realloc");
    }

    /// Trace an internal step without touching the counters.
    pub(crate) fn note(&self, kind: AllocKind, size: usize, ptr: *const u8) {
        if self.enabled {
            tracing::trace!(kind = kind.label(), size, addr = ?ptr, "alloc");
        }
    }

    pub(crate) fn snapshot(&self) -> AllocationStats {
        AllocationStats {
            live: self.live.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            bytes_allocated: self.bytes.load(Ordering::Relaxed),
        }
    }
}
