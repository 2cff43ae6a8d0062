//! # Memory-Bounded Region Cache
//!
//! This module implements the public cache API: a reference-counted object
//! cache whose payloads live inside a small number of large mapped chunks,
//! with a hard upper bound on the total mapped footprint. It is built for
//! heap-indirecting values (a decoded block, a dictionary, a compiled
//! expression) whose bulk data can be pointed at cache-owned memory while a
//! small header travels with the key.
//!
//! ## Guarantees
//!
//! - **Bounded footprint**: mapped bytes never exceed the configured
//!   capacity, fragmentation included. Growth beyond the cap is served by
//!   evicting unreferenced values instead.
//! - **Single producer per key**: concurrent misses on one key run the size
//!   and init functors exactly once; the other threads block and share the
//!   produced handle.
//! - **Safe eviction**: a value referenced by any handle is never evicted,
//!   and a released value stays cached and revivable until eviction actually
//!   reclaims its space.
//! - **Coalescing**: freed regions merge with free neighbors eagerly, so
//!   fragmentation is bounded and recoverable.
//!
//! ## Locking
//!
//! ```text
//! attempts  ── the per-key insertion attempt map
//! attempt   ── one attempt's mutex; held across the user functors
//! allocator ── chunks, index views, byte accounting
//! lookup    ── the key index and its count
//! region    ── one region's reference count
//! ```
//!
//! Acquisition order is `attempts` before `attempt`, and `allocator` before
//! `lookup` before `region`. Skipping levels is fine, inverting them is not.
//! The hit fast path takes only `lookup` and `region`, so cache hits never
//! contend with allocation; a hit on a demoted entry backs off and re-enters
//! through the allocator lock to pull the entry out of the eviction queue.
//! The user functors run while only the attempt mutex is held, so lookups
//! and insertions for other keys proceed during a slow production.
//!
//! ## Usage
//!
//! ```ignore
//! let cache: RegionCache<u64, ()> = RegionCache::builder()
//!     .capacity(64 * 1024 * 1024)
//!     .value_alignment(64)
//!     .build()?;
//!
//! let (entry, produced) = cache.get_or_insert_with(
//!     &block_id,
//!     || Ok(block_len),
//!     |payload| {
//!         decode_into(block_id, payload)?;
//!         Ok(())
//!     },
//! )?;
//! ```
//!
//! Contents are purely in-memory and vanish with the cache; there is no
//! persistence layer.

pub(crate) mod stats;

mod handle;
mod singleflight;

use std::error::Error;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::DefaultHashBuilder;
use parking_lot::Mutex;

use crate::alloc::arena::{Arena, ChunkAddressHint, LookupMap};
use crate::alloc::region::{Region, Slot};
use crate::config::{round_up, DEFAULT_MIN_CHUNK_SIZE, DEFAULT_VALUE_ALIGNMENT, PAGE_SIZE};
use crate::tracker::MemoryTracker;

pub use handle::CacheEntry;
pub use stats::CacheStats;

use singleflight::{AttemptGuard, AttemptMap};

/// The configured capacity cannot host even a single chunk.
#[derive(Debug)]
pub struct CapacityTooSmall {
    pub capacity: usize,
    pub min_chunk_size: usize,
}

impl fmt::Display for CapacityTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache capacity {} is below the minimum chunk size {}",
            self.capacity, self.min_chunk_size
        )
    }
}

impl Error for CapacityTooSmall {}

/// State shared by the cache value and every handle issued from it.
pub(crate) struct Shared<K, V, S> {
    arena: Mutex<Arena<K, V>>,
    lookup: Mutex<LookupMap<K, V>>,
    attempts: Mutex<AttemptMap<K, V, S>>,
    counters: stats::Counters,
}

impl<K, V, S> Shared<K, V, S> {
    /// Drops one reference to `region`. The last reference demotes it into
    /// the eviction queue; the key and value stay cached for revival.
    pub(crate) fn release(&self, region: &Arc<Region<K, V>>) {
        let mut arena = self.arena.lock();
        let mut refs = region.refs().lock();
        *refs -= 1;
        if *refs > 0 {
            return;
        }
        drop(refs);

        // SAFETY: allocator lock held.
        let len = unsafe { region.geom() }.len;
        arena.push_unused(region);
        self.counters.size_in_use.fetch_sub(len, Ordering::Relaxed);
    }
}

/// Reference-counted object cache backed by a bounded region allocator.
///
/// Cloning the cache is cheap and shares all state, like cloning a database
/// connection handle.
pub struct RegionCache<K, V, S = DefaultHashBuilder> {
    shared: Arc<Shared<K, V, S>>,
}

impl<K, V, S> Clone for RegionCache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V, S> fmt::Debug for RegionCache<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionCache").finish_non_exhaustive()
    }
}

impl<K, V> RegionCache<K, V>
where
    K: Ord + Hash + Clone,
{
    /// Creates a cache with the given capacity in bytes and default settings.
    pub fn new(capacity: usize) -> Result<Self> {
        RegionCacheBuilder::new().capacity(capacity).build()
    }

    /// Starts configuring a cache.
    pub fn builder() -> RegionCacheBuilder<K, V> {
        RegionCacheBuilder::new()
    }
}

impl<K, V, S> RegionCache<K, V, S>
where
    K: Ord + Hash + Clone,
    S: BuildHasher,
{
    /// Looks the key up without producing anything.
    pub fn get(&self, key: &K) -> Option<CacheEntry<K, V, S>> {
        match self.lookup_entry(key) {
            Some(entry) => {
                self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the cached value for `key`, producing it on a miss.
    ///
    /// On a miss, `size_fn` is asked for the payload size, a region of that
    /// size (rounded up to the value alignment) is allocated, and `init_fn`
    /// fills the payload and returns the value header to cache. Concurrent
    /// callers missing on the same key invoke the functors once between them;
    /// the losers block and receive the winner's handle.
    ///
    /// The boolean reports whether this call produced the value. The
    /// combination `(None, true)` means the allocator could not serve the
    /// request: the cache is at capacity with every byte referenced, or the
    /// size was zero. A functor failure propagates as an error, leaves the
    /// cache unchanged, and is not remembered; the next caller retries.
    pub fn get_or_insert_with<Sz, Init>(
        &self,
        key: &K,
        size_fn: Sz,
        init_fn: Init,
    ) -> Result<(Option<CacheEntry<K, V, S>>, bool)>
    where
        Sz: FnOnce() -> Result<usize>,
        Init: FnOnce(&mut [u8]) -> Result<V>,
    {
        if let Some(entry) = self.lookup_entry(key) {
            self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((Some(entry), false));
        }

        let mut guard = AttemptGuard::join(&self.shared.attempts, key);
        let attempt = guard.attempt().clone();
        let mut gate = attempt.gate.lock();

        if let Some(entry) = (*gate).clone() {
            // A queued-ahead thread finished this key while we waited.
            self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.shared
                .counters
                .concurrent_hits
                .fetch_add(1, Ordering::Relaxed);
            drop(gate);
            guard.release();
            return Ok((Some(entry), false));
        }

        // This thread is the producer. The insertion that made our first
        // probe miss may have completed and retired its attempt before the
        // join above, so probe again now that the key is serialized.
        if let Some(entry) = self.lookup_entry(key) {
            self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.shared
                .counters
                .concurrent_hits
                .fetch_add(1, Ordering::Relaxed);
            drop(gate);
            guard.release();
            return Ok((Some(entry), false));
        }

        self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);

        let size = size_fn()?;

        let region = self
            .shared
            .arena
            .lock()
            .allocate(size, &self.shared.lookup, &self.shared.counters)?;
        let Some(region) = region else {
            tracing::warn!(size, "cache is full and fully referenced, refusing to insert");
            drop(gate);
            guard.release();
            return Ok((None, true));
        };

        // SAFETY: the region is reserved; this thread is its sole owner.
        let payload = unsafe { region.payload_mut() };
        let len = payload.len();
        self.shared
            .counters
            .size_initialized
            .fetch_add(len, Ordering::Relaxed);

        let value = match init_fn(payload) {
            Ok(value) => value,
            Err(err) => {
                self.shared
                    .counters
                    .size_initialized
                    .fetch_sub(len, Ordering::Relaxed);
                self.shared.arena.lock().release_reserved(&region);
                drop(gate);
                guard.release();
                return Err(err);
            }
        };

        // SAFETY: still the sole owner of the reserved region.
        unsafe {
            region.set_slot(Slot {
                key: key.clone(),
                value,
            });
        }

        self.promote_fresh(key.clone(), &region);
        let entry = CacheEntry::new(self.shared.clone(), region);
        *gate = Some(entry.clone());
        drop(gate);
        guard.release();

        Ok((Some(entry), true))
    }

    /// Snapshot of sizes, populations, and event counters.
    pub fn stats(&self) -> CacheStats {
        let arena = self.shared.arena.lock();
        let counters = &self.shared.counters;

        let mut stats = CacheStats {
            chunks_size: arena.chunks_size,
            allocated_size: arena.allocated_size,
            initialized_size: counters.size_initialized.load(Ordering::Relaxed),
            used_size: counters.size_in_use.load(Ordering::Relaxed),
            chunks: arena.chunks(),
            regions: arena.regions(),
            free_regions: arena.free_regions(),
            unused_regions: arena.unused_regions(),
            used_regions: 0,
            hits: counters.hits.load(Ordering::Relaxed),
            concurrent_hits: counters.concurrent_hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            allocations: arena.allocations,
            allocated_bytes: arena.allocated_bytes,
            evictions: arena.evictions,
            evicted_bytes: arena.evicted_bytes,
            secondary_evictions: arena.secondary_evictions,
        };

        let lookup = self.shared.lookup.lock();
        stats.used_regions = lookup.len().saturating_sub(arena.unused_regions());
        stats
    }

    /// Releases everything that is not referenced: pending insertion
    /// attempts, unreferenced values, free space, and every chunk left with
    /// nothing alive inside. Live handles are untouched and stay valid.
    ///
    /// With `clear_counters` set, the hit/miss/allocation/eviction counters
    /// restart from zero.
    pub fn shrink_to_fit(&self, clear_counters: bool) -> Result<()> {
        self.shared.attempts.lock().clear();

        let mut arena = self.shared.arena.lock();
        let mut lookup = self.shared.lookup.lock();
        let result = arena.shrink(&mut lookup, &self.shared.counters, clear_counters);

        if clear_counters {
            self.shared.counters.hits.store(0, Ordering::Relaxed);
            self.shared
                .counters
                .concurrent_hits
                .store(0, Ordering::Relaxed);
            self.shared.counters.misses.store(0, Ordering::Relaxed);
        }

        result
    }

    /// Synonym of `shrink_to_fit(true)`. Values referenced by live handles
    /// survive and are not invalidated on later access.
    pub fn reset(&self) -> Result<()> {
        self.shrink_to_fit(true)
    }

    /// Upper bound on mapped bytes.
    pub fn capacity(&self) -> usize {
        self.shared.arena.lock().capacity()
    }

    /// Number of cached values, referenced or not.
    pub fn len(&self) -> usize {
        self.shared.lookup.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks every structural invariant and panics on the first violation.
    /// A test and debugging aid; never called on the production paths.
    pub fn validate(&self) {
        let arena = self.shared.arena.lock();
        let lookup = self.shared.lookup.lock();
        arena.validate(&lookup, &self.shared.counters);
    }

    /// Finds `key` and raises the region's reference count, reviving the
    /// region out of the eviction queue when it was demoted.
    fn lookup_entry(&self, key: &K) -> Option<CacheEntry<K, V, S>> {
        {
            let lookup = self.shared.lookup.lock();
            match lookup.get(key) {
                None => return None,
                Some(region) => {
                    let region = region.clone();
                    let mut refs = region.refs().lock();
                    if *refs > 0 {
                        *refs += 1;
                        drop(refs);
                        drop(lookup);
                        return Some(CacheEntry::new(self.shared.clone(), region));
                    }
                    // Demoted. Reviving removes it from the eviction queue,
                    // which needs the allocator lock first; retry in order.
                }
            }
        }

        let mut arena = self.shared.arena.lock();
        let region = {
            let lookup = self.shared.lookup.lock();
            match lookup.get(key) {
                // Evicted between the two probes.
                None => return None,
                Some(region) => region.clone(),
            }
        };

        let mut refs = region.refs().lock();
        *refs += 1;
        if *refs == 1 {
            // SAFETY: allocator lock held.
            let len = unsafe { region.geom() }.len;
            arena.mark_used(&region);
            self.shared
                .counters
                .size_in_use
                .fetch_add(len, Ordering::Relaxed);
        }
        drop(refs);
        drop(arena);
        Some(CacheEntry::new(self.shared.clone(), region))
    }

    /// Publishes a freshly produced region: key into the lookup index, first
    /// reference taken, chunk pinned.
    fn promote_fresh(&self, key: K, region: &Arc<Region<K, V>>) {
        let mut arena = self.shared.arena.lock();
        {
            let mut lookup = self.shared.lookup.lock();
            let previous = lookup.insert(key, region.clone());
            debug_assert!(
                previous.is_none(),
                "two producers completed for the same key"
            );
        }

        let mut refs = region.refs().lock();
        debug_assert_eq!(*refs, 0);
        *refs = 1;
        drop(refs);

        // SAFETY: allocator lock held.
        let len = unsafe { region.geom() }.len;
        arena.mark_used(region);
        self.shared
            .counters
            .size_in_use
            .fetch_add(len, Ordering::Relaxed);
    }
}

/// Configures and opens a [`RegionCache`].
pub struct RegionCacheBuilder<K, V, S = DefaultHashBuilder> {
    capacity: Option<usize>,
    min_chunk_size: usize,
    value_alignment: usize,
    tracker: Option<Arc<dyn MemoryTracker>>,
    address_hint: Option<ChunkAddressHint>,
    hash_builder: S,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for RegionCacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RegionCacheBuilder<K, V> {
    pub fn new() -> Self {
        Self {
            capacity: None,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            value_alignment: DEFAULT_VALUE_ALIGNMENT,
            tracker: None,
            address_hint: None,
            hash_builder: DefaultHashBuilder::default(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, S> RegionCacheBuilder<K, V, S> {
    /// Upper bound on mapped bytes, fragmentation included. Required.
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Smallest chunk the cache maps when growing. Rounded up to a whole
    /// number of pages.
    pub fn min_chunk_size(mut self, bytes: usize) -> Self {
        self.min_chunk_size = bytes;
        self
    }

    /// Alignment of every payload pointer handed to an init functor. Region
    /// sizes round up to this. Must be a power of two no larger than a page.
    pub fn value_alignment(mut self, bytes: usize) -> Self {
        self.value_alignment = bytes;
        self
    }

    /// Sink notified about every chunk the cache maps and unmaps.
    pub fn memory_tracker(mut self, tracker: Arc<dyn MemoryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Source of placement hints for new chunks, typically randomized to
    /// keep cache memory far from the regular heap.
    pub fn chunk_address_hint<F>(mut self, hint: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.address_hint = Some(Box::new(hint));
        self
    }

    /// Hasher for the per-key insertion attempt map.
    pub fn hash_builder<S2: BuildHasher>(self, hash_builder: S2) -> RegionCacheBuilder<K, V, S2> {
        RegionCacheBuilder {
            capacity: self.capacity,
            min_chunk_size: self.min_chunk_size,
            value_alignment: self.value_alignment,
            tracker: self.tracker,
            address_hint: self.address_hint,
            hash_builder,
            _marker: PhantomData,
        }
    }

    pub fn build(self) -> Result<RegionCache<K, V, S>>
    where
        K: Ord + Hash + Clone,
        S: BuildHasher,
    {
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => bail!("cache capacity must be configured"),
        };
        ensure!(
            self.value_alignment.is_power_of_two() && self.value_alignment <= PAGE_SIZE,
            "value alignment {} must be a power of two no larger than {}",
            self.value_alignment,
            PAGE_SIZE
        );

        let min_chunk_size = round_up(self.min_chunk_size.max(PAGE_SIZE), PAGE_SIZE);
        if capacity < min_chunk_size {
            bail!(CapacityTooSmall {
                capacity,
                min_chunk_size,
            });
        }

        Ok(RegionCache {
            shared: Arc::new(Shared {
                arena: Mutex::new(Arena::new(
                    capacity,
                    min_chunk_size,
                    self.value_alignment,
                    self.tracker,
                    self.address_hint,
                )),
                lookup: Mutex::new(LookupMap::new()),
                attempts: Mutex::new(AttemptMap::with_hasher(self.hash_builder)),
                counters: stats::Counters::new(),
            }),
        })
    }
}
