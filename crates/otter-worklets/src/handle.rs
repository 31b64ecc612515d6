//! Opaque handles used to key every registry entry.
//!
//! Handles replace pointers between mappers, cells, event handlers and stored
//! values. They are allocated from a [`HandleAllocator`] owned by the
//! embedding module, are never reused, and `0` is reserved as the invalid
//! handle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier for a registered value, cell, mapper or event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The reserved "null" handle. No allocator ever returns it.
    pub const INVALID: Handle = Handle(0);

    /// Wrap a raw id received from script code.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id, e.g. to hand back to script code as a number.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is anything other than [`Handle::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<Handle> for serde_json::Value {
    fn from(handle: Handle) -> Self {
        serde_json::Value::from(handle.0)
    }
}

/// Monotonic handle source. Starts at 1.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    /// Create an allocator whose first handle is `1`.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next handle.
    pub fn allocate(&self) -> Handle {
        Handle(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of handles handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
