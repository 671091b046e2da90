//! Address side table.
//!
//! Maps each pointer handed to a caller to the raw block it was carved from.
//! Aligning allocators record `aligned -> raw`; page allocators record
//! `base -> mapping length`, which `munmap` needs on free.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;

/// The underlying block behind a user-visible address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawBlock {
    /// Start of the block as returned by the underlying primitive.
    pub ptr: NonNull<u8>,
    /// Bytes requested from the underlying primitive.
    pub len: usize,
    /// Whether the block is backed by large pages.
    pub large: bool,
}

impl RawBlock {
    pub(crate) const fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            large: false,
        }
    }
}

// SAFETY: a RawBlock is only an address record; the table never dereferences it.
#[allow(unsafe_code)]
unsafe impl Send for RawBlock {}

/// One entry per live user-visible address. Insert and remove are O(1).
#[derive(Debug, Default)]
pub(crate) struct BlockTable {
    entries: Mutex<HashMap<usize, RawBlock>>,
}

impl BlockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record `user -> raw`.
    pub(crate) fn insert(&self, user: NonNull<u8>, raw: RawBlock) {
        let previous = self.entries.lock().insert(user.as_ptr() as usize, raw);
        debug_assert!(previous.is_none(), "address {user:p} handed out twice");
    }

    /// Remove and return the record for `user`.
    pub(crate) fn remove(&self, user: *mut u8) -> Option<RawBlock> {
        self.entries.lock().remove(&(user as usize))
    }

    /// Number of live records.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
