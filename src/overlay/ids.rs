//! Identifier types and the counters that hand them out

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Registry key for "the current overlay instance of one call site"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(u64);

impl SlotId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one before-close hook registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// Hands out slot identifiers, strictly increasing, never reused
#[derive(Debug, Default)]
pub struct HandleAllocator {
    count: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh slot identifier
    pub fn generate(&self) -> SlotId {
        SlotId(self.count.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Hook id counter shared by every overlay of one registry
#[derive(Debug, Clone, Default)]
pub struct HookIdAllocator {
    count: Arc<AtomicU64>,
}

impl HookIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> HookId {
        HookId(self.count.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
