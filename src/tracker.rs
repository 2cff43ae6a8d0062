//! # Memory Accounting Sink
//!
//! The cache notifies an embedding application about every chunk it maps and
//! unmaps, so a process-wide memory budget can account for the cache's real
//! footprint (including allocator fragmentation, since whole chunks are
//! reported). The sink is informational: it cannot veto a mapping. The cache
//! enforces its own capacity bound independently.

use std::sync::Arc;

/// Receives chunk mapping notifications.
///
/// Implementations must be cheap and must not call back into the cache; the
/// notifications are delivered while the allocator lock is held.
pub trait MemoryTracker: Send + Sync {
    /// A chunk of `bytes` was mapped.
    fn mapped(&self, bytes: usize);

    /// A chunk of `bytes` was unmapped.
    fn unmapped(&self, bytes: usize);
}

impl<T: MemoryTracker + ?Sized> MemoryTracker for Arc<T> {
    fn mapped(&self, bytes: usize) {
        (**self).mapped(bytes)
    }

    fn unmapped(&self, bytes: usize) {
        (**self).unmapped(bytes)
    }
}
