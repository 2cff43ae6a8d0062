//! # Cache Statistics
//!
//! Counter storage and the snapshot returned by `RegionCache::stats`. Event
//! counters that are only touched under the allocator lock live as plain
//! integers in the arena; the counters here are updated outside it and are
//! therefore atomic.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize};

/// Counters updated outside the allocator lock.
pub(crate) struct Counters {
    /// Lookups that found a value. Includes `concurrent_hits`.
    pub(crate) hits: AtomicU64,
    /// Lookups resolved by another thread finishing the same insertion.
    pub(crate) concurrent_hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    /// Bytes of regions currently referenced by at least one handle.
    pub(crate) size_in_use: AtomicUsize,
    /// Bytes of regions whose payload has been (or is being) initialized.
    pub(crate) size_initialized: AtomicUsize,
}

impl Counters {
    pub(crate) fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            concurrent_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            size_in_use: AtomicUsize::new(0),
            size_initialized: AtomicUsize::new(0),
        }
    }
}

/// Point-in-time snapshot of the cache state.
///
/// Sizes describe payload bytes only; region records and index nodes are
/// ordinary heap allocations and are not accounted here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total mapped bytes, including free and fragmented space.
    pub chunks_size: usize,
    /// Bytes of regions that hold or are receiving a value.
    pub allocated_size: usize,
    /// Bytes of payloads initialized or mid-initialization.
    pub initialized_size: usize,
    /// Bytes of regions referenced by at least one handle.
    pub used_size: usize,

    pub chunks: usize,
    pub regions: usize,
    pub free_regions: usize,
    pub unused_regions: usize,
    pub used_regions: usize,

    /// Lookups that found a value. Includes `concurrent_hits`.
    pub hits: u64,
    /// Hits resolved by waiting out another thread's insertion.
    pub concurrent_hits: u64,
    pub misses: u64,

    pub allocations: u64,
    pub allocated_bytes: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub secondary_evictions: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mapped:{},allocated:{},in_use:{},chunks:{},regions:{}/{}f/{}u,hit:{},miss:{},evict:{}",
            self.chunks_size,
            self.allocated_size,
            self.used_size,
            self.chunks,
            self.regions,
            self.free_regions,
            self.unused_regions,
            self.hits,
            self.misses,
            self.evictions
        )
    }
}
