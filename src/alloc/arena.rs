//! # Region Allocator
//!
//! This module implements the allocation engine behind the cache: a best-fit
//! allocator over a small number of large mapped chunks, with cache eviction
//! as its fallback when the footprint cap leaves no room to grow.
//!
//! ## Index Views
//!
//! Every region record is reachable through up to three of four views:
//!
//! ```text
//! by_addr  ── all regions, ordered by payload address. Neighbor queries for
//!             coalescing and for secondary eviction.
//! free     ── free regions keyed by (len, addr). A range scan from
//!             (requested, 0) yields the best fit in O(log n).
//! lru      ── unused regions keyed by a monotonic demotion tick. The first
//!             entry is the next eviction victim.
//! lookup   ── keys of used and unused regions. Owned by the cache layer and
//!             guarded by its own mutex; the allocator only touches it while
//!             evicting, to drop the victim's key.
//! ```
//!
//! ## Allocation Strategy
//!
//! 1. Round the request up to the value alignment.
//! 2. Take the smallest free region that fits and split it.
//! 3. Otherwise map a new chunk, if the footprint cap allows it.
//! 4. Otherwise evict unused regions in LRU order until a large enough span
//!    coalesces, or fail if nothing is evictable.
//!
//! ## Eviction and Coalescing
//!
//! Evicting a region frees it and merges it with free neighbors in the same
//! chunk. If the merged span is still too small, the eviction continues with
//! the next adjacent region to the right, as long as that region is unused
//! and in the same chunk (secondary eviction). Freed spans merge eagerly, so
//! two adjacent free regions never coexist.
//!
//! ## Why Whole-Chunk Accounting
//!
//! The capacity bound is checked against mapped chunk bytes, not allocated
//! bytes. Fragmentation overhead therefore counts against the cap, which
//! keeps the cache's true memory footprint bounded no matter how unlucky the
//! allocation pattern is.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cache::stats::Counters;
use crate::config::{round_up, PAGE_SIZE};
use crate::tracker::MemoryTracker;

use super::chunk::{ChunkId, MemoryChunk};
use super::region::{Region, RegionState};

/// Address-hint source for chunk placement.
pub type ChunkAddressHint = Box<dyn Fn() -> usize + Send + Sync>;

/// Keys of used and unused regions. Guarded by the cache's lookup mutex.
pub(crate) type LookupMap<K, V> = BTreeMap<K, Arc<Region<K, V>>>;

pub(crate) struct Arena<K, V> {
    chunks: HashMap<ChunkId, MemoryChunk>,
    next_chunk: u64,
    by_addr: BTreeMap<usize, Arc<Region<K, V>>>,
    free: BTreeMap<(usize, usize), Arc<Region<K, V>>>,
    lru: BTreeMap<u64, Arc<Region<K, V>>>,
    next_tick: u64,

    capacity: usize,
    min_chunk_size: usize,
    value_alignment: usize,
    tracker: Option<Arc<dyn MemoryTracker>>,
    address_hint: Option<ChunkAddressHint>,

    pub(crate) chunks_size: usize,
    pub(crate) allocated_size: usize,
    pub(crate) allocations: u64,
    pub(crate) allocated_bytes: u64,
    pub(crate) evictions: u64,
    pub(crate) evicted_bytes: u64,
    pub(crate) secondary_evictions: u64,
}

impl<K, V> Arena<K, V> {
    pub(crate) fn new(
        capacity: usize,
        min_chunk_size: usize,
        value_alignment: usize,
        tracker: Option<Arc<dyn MemoryTracker>>,
        address_hint: Option<ChunkAddressHint>,
    ) -> Self {
        debug_assert!(min_chunk_size % PAGE_SIZE == 0);
        debug_assert!(value_alignment.is_power_of_two() && value_alignment <= PAGE_SIZE);

        Self {
            chunks: HashMap::new(),
            next_chunk: 0,
            by_addr: BTreeMap::new(),
            free: BTreeMap::new(),
            lru: BTreeMap::new(),
            next_tick: 0,
            capacity,
            min_chunk_size,
            value_alignment,
            tracker,
            address_hint,
            chunks_size: 0,
            allocated_size: 0,
            allocations: 0,
            allocated_bytes: 0,
            evictions: 0,
            evicted_bytes: 0,
            secondary_evictions: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn chunks(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn regions(&self) -> usize {
        self.by_addr.len()
    }

    pub(crate) fn free_regions(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn unused_regions(&self) -> usize {
        self.lru.len()
    }

    /// Allocates a region of at least `size` bytes, rounded up to the value
    /// alignment. Returns `None` when the request is zero or when the cache
    /// is full and nothing is evictable; fails only if mapping a new chunk
    /// fails.
    ///
    /// The returned region is in the Reserved state: linked in the address
    /// index, invisible to every other view, owned by the caller.
    pub(crate) fn allocate(
        &mut self,
        size: usize,
        lookup: &Mutex<LookupMap<K, V>>,
        counters: &Counters,
    ) -> Result<Option<Arc<Region<K, V>>>>
    where
        K: Ord,
    {
        if size == 0 {
            return Ok(None);
        }
        let size = round_up(size, self.value_alignment);

        if let Some((_, region)) = self.free.range((size, 0)..).next() {
            let region = region.clone();
            return Ok(Some(self.allocate_from_free(region, size)));
        }

        let grown = self.min_chunk_size.max(round_up(size, PAGE_SIZE));
        if self.chunks_size + grown <= self.capacity {
            let spanning = self.add_chunk(grown)?;
            return Ok(Some(self.allocate_from_free(spanning, size)));
        }

        loop {
            let Some(region) = self.evict(size, lookup, counters) else {
                return Ok(None);
            };
            // SAFETY: the arena sits behind the allocator lock; `&mut self`
            // proves the caller holds it.
            if unsafe { region.geom() }.len < size {
                continue;
            }
            return Ok(Some(self.allocate_from_free(region, size)));
        }
    }

    /// Occupies `size` bytes at the front of a free region, splitting off the
    /// remainder back into the free index.
    fn allocate_from_free(
        &mut self,
        region: Arc<Region<K, V>>,
        size: usize,
    ) -> Arc<Region<K, V>> {
        self.allocations += 1;
        self.allocated_bytes += size as u64;
        self.allocated_size += size;

        // SAFETY: allocator lock held (`&mut self`).
        let (addr, len, chunk) = {
            let geom = unsafe { region.geom() };
            debug_assert_eq!(geom.state, RegionState::Free);
            debug_assert!(geom.len >= size);
            (geom.addr, geom.len, geom.chunk)
        };
        self.free.remove(&(len, addr));

        if len == size {
            // SAFETY: allocator lock held.
            unsafe { region.geom_mut() }.state = RegionState::Reserved;
            return region;
        }

        let carved = Region::new(addr, size, chunk, RegionState::Reserved);

        // Shrink the donor in place and re-key it in both views.
        {
            // SAFETY: allocator lock held.
            let geom = unsafe { region.geom_mut() };
            geom.addr = addr + size;
            geom.len = len - size;
        }
        self.by_addr.remove(&addr);
        self.by_addr.insert(addr + size, region.clone());
        self.free.insert((len - size, addr + size), region);
        self.by_addr.insert(addr, carved.clone());

        carved
    }

    /// Maps a new chunk and returns the free region spanning it.
    fn add_chunk(&mut self, len: usize) -> Result<Arc<Region<K, V>>> {
        let hint = self.address_hint.as_ref().map_or(0, |hint| hint());
        let chunk = MemoryChunk::map(len, hint, self.tracker.clone())?;
        let id = ChunkId(self.next_chunk);
        self.next_chunk += 1;

        let addr = chunk.addr();
        self.chunks_size += len;
        self.chunks.insert(id, chunk);

        let spanning = Region::new(addr, len, id, RegionState::Free);
        self.by_addr.insert(addr, spanning.clone());
        self.free.insert((len, addr), spanning.clone());
        Ok(spanning)
    }

    /// Evicts unused regions starting at the LRU front until the freed span
    /// reaches `requested` bytes or nothing adjacent is evictable. Returns
    /// the coalesced free region, or `None` when the queue is empty.
    fn evict(
        &mut self,
        requested: usize,
        lookup: &Mutex<LookupMap<K, V>>,
        counters: &Counters,
    ) -> Option<Arc<Region<K, V>>>
    where
        K: Ord,
    {
        let mut victim = self.lru.values().next()?.clone();

        loop {
            let (len, chunk) = {
                // SAFETY: allocator lock held.
                let geom = unsafe { victim.geom_mut() };
                debug_assert_eq!(geom.state, RegionState::Unused);
                let tick = geom
                    .lru_tick
                    .take()
                    .expect("unused region missing its eviction queue position");
                self.lru.remove(&tick);
                (geom.len, geom.chunk)
            };

            // SAFETY: allocator lock held and the refcount of an unused
            // region is zero, so nothing can be reading the slot.
            if let Some(slot) = unsafe { victim.take_slot() } {
                let mut lookup = lookup.lock();
                if lookup
                    .get(&slot.key)
                    .is_some_and(|current| Arc::ptr_eq(current, &victim))
                {
                    lookup.remove(&slot.key);
                }
                counters.size_initialized.fetch_sub(len, Ordering::Relaxed);
            }

            self.allocated_size -= len;
            self.evictions += 1;
            self.evicted_bytes += len as u64;

            self.free_and_coalesce(&victim);

            // SAFETY: allocator lock held.
            let (addr, merged) = {
                let geom = unsafe { victim.geom() };
                (geom.addr, geom.len)
            };
            if merged >= requested {
                return Some(victim);
            }

            // Still too small. Continue into the next region to the right if
            // it is adjacent, in the same chunk, and also unused; evicting it
            // will absorb the span just freed. Stop at the chunk boundary or
            // the first region that is not evictable.
            let next = self
                .by_addr
                .range(addr + 1..)
                .next()
                .map(|(_, region)| region.clone());
            match next {
                Some(next)
                    if {
                        // SAFETY: allocator lock held.
                        let geom = unsafe { next.geom() };
                        geom.chunk == chunk
                            && geom.addr == addr + merged
                            && geom.state == RegionState::Unused
                    } =>
                {
                    self.secondary_evictions += 1;
                    victim = next;
                }
                _ => return Some(victim),
            }
        }
    }

    /// Returns `region` to the free index, absorbing any directly adjacent
    /// free neighbor in the same chunk.
    ///
    /// The region must not be linked in the free, eviction, or lookup views,
    /// and its slot must already be empty.
    pub(crate) fn free_and_coalesce(&mut self, region: &Arc<Region<K, V>>) {
        // SAFETY: allocator lock held throughout.
        debug_assert!(unsafe { region.slot() }.is_none());
        let (mut addr, mut len, chunk) = {
            let geom = unsafe { region.geom() };
            debug_assert!(geom.lru_tick.is_none());
            (geom.addr, geom.len, geom.chunk)
        };

        if let Some((_, left)) = self.by_addr.range(..addr).next_back() {
            let left = left.clone();
            let (l_addr, l_len, l_chunk, l_state) = {
                let geom = unsafe { left.geom() };
                (geom.addr, geom.len, geom.chunk, geom.state)
            };
            if l_chunk == chunk && l_state == RegionState::Free && l_addr + l_len == addr {
                self.free.remove(&(l_len, l_addr));
                self.by_addr.remove(&l_addr);
                self.by_addr.remove(&addr);
                addr = l_addr;
                len += l_len;
                self.by_addr.insert(addr, region.clone());
            }
        }

        if let Some((_, right)) = self.by_addr.range(addr + 1..).next() {
            let right = right.clone();
            let (r_addr, r_len, r_chunk, r_state) = {
                let geom = unsafe { right.geom() };
                (geom.addr, geom.len, geom.chunk, geom.state)
            };
            if r_chunk == chunk && r_state == RegionState::Free && addr + len == r_addr {
                self.free.remove(&(r_len, r_addr));
                self.by_addr.remove(&r_addr);
                len += r_len;
            }
        }

        {
            let geom = unsafe { region.geom_mut() };
            geom.addr = addr;
            geom.len = len;
            geom.state = RegionState::Free;
        }
        self.free.insert((len, addr), region.clone());
    }

    /// Aborts an in-flight reservation, undoing its allocation accounting.
    pub(crate) fn release_reserved(&mut self, region: &Arc<Region<K, V>>) {
        // SAFETY: allocator lock held.
        let (len, state) = {
            let geom = unsafe { region.geom() };
            (geom.len, geom.state)
        };
        debug_assert_eq!(state, RegionState::Reserved);
        self.allocated_size -= len;
        self.free_and_coalesce(region);
    }

    /// Marks a region referenced: unlinks it from the eviction queue if it
    /// was demoted, and pins its chunk. The caller has just raised the
    /// region's refcount from zero under the region mutex.
    pub(crate) fn mark_used(&mut self, region: &Arc<Region<K, V>>) {
        // SAFETY: allocator lock held.
        let geom = unsafe { region.geom_mut() };
        debug_assert!(matches!(
            geom.state,
            RegionState::Reserved | RegionState::Unused
        ));
        if let Some(tick) = geom.lru_tick.take() {
            self.lru.remove(&tick);
        }
        geom.state = RegionState::Used;
        self.chunks
            .get(&geom.chunk)
            .expect("used region rooted in an unmapped chunk")
            .pin();
    }

    /// Demotes a region whose refcount just dropped to zero: unpins its chunk
    /// and queues it at the back of the eviction order. The key stays in the
    /// lookup index so the region can be revived until it is evicted.
    pub(crate) fn push_unused(&mut self, region: &Arc<Region<K, V>>) {
        // SAFETY: allocator lock held.
        let geom = unsafe { region.geom_mut() };
        debug_assert_eq!(geom.state, RegionState::Used);
        debug_assert!(geom.lru_tick.is_none());

        let tick = self.next_tick;
        self.next_tick += 1;
        geom.state = RegionState::Unused;
        geom.lru_tick = Some(tick);
        self.lru.insert(tick, region.clone());
        self.chunks
            .get(&geom.chunk)
            .expect("demoted region rooted in an unmapped chunk")
            .unpin();
    }

    /// Destroys every free and unused region, unmaps every chunk with no
    /// referenced region left, and re-derives the accounting from the
    /// survivors. Event counters are cleared when `clear_counters` is set.
    pub(crate) fn shrink(
        &mut self,
        lookup: &mut LookupMap<K, V>,
        counters: &Counters,
        clear_counters: bool,
    ) -> Result<()>
    where
        K: Ord,
    {
        let unused: Vec<Arc<Region<K, V>>> = self.lru.values().cloned().collect();
        self.lru.clear();
        for region in unused {
            // SAFETY: allocator lock held; unused regions have refcount zero.
            let addr = {
                let geom = unsafe { region.geom_mut() };
                geom.lru_tick = None;
                geom.addr
            };
            if let Some(slot) = unsafe { region.take_slot() } {
                if lookup
                    .get(&slot.key)
                    .is_some_and(|current| Arc::ptr_eq(current, &region))
                {
                    lookup.remove(&slot.key);
                }
            }
            self.by_addr.remove(&addr);
        }

        let free: Vec<Arc<Region<K, V>>> = self.free.values().cloned().collect();
        self.free.clear();
        for region in free {
            // SAFETY: allocator lock held.
            let addr = unsafe { region.geom() }.addr;
            self.by_addr.remove(&addr);
        }

        // A chunk may only be unmapped when no referenced region pins it and
        // no in-flight reservation is rooted in it. A reservation does not
        // pin its chunk yet, so the address index is the authority here.
        let dead: SmallVec<[ChunkId; 4]> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| {
                chunk.pinned() == 0 && !self.has_regions_in(chunk.addr(), chunk.len())
            })
            .map(|(id, _)| *id)
            .collect();

        let mut first_err = None;
        for id in dead {
            let mut chunk = self.chunks.remove(&id).expect("chunk selected for unmapping");
            self.chunks_size -= chunk.len();
            if let Err(err) = chunk.release() {
                first_err.get_or_insert(err);
            }
        }

        // Surviving regions are all used or reserved; re-derive the byte
        // accounting from them so the books stay balanced when referenced
        // regions keep their chunks alive.
        let mut allocated = 0;
        let mut in_use = 0;
        for region in self.by_addr.values() {
            // SAFETY: allocator lock held.
            let geom = unsafe { region.geom() };
            debug_assert_ne!(geom.state, RegionState::Free);
            allocated += geom.len;
            if geom.state == RegionState::Used {
                in_use += geom.len;
            }
        }
        self.allocated_size = allocated;
        counters.size_in_use.store(in_use, Ordering::Relaxed);
        counters.size_initialized.store(allocated, Ordering::Relaxed);

        if clear_counters {
            self.allocations = 0;
            self.allocated_bytes = 0;
            self.evictions = 0;
            self.evicted_bytes = 0;
            self.secondary_evictions = 0;
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn has_regions_in(&self, addr: usize, len: usize) -> bool {
        self.by_addr.range(addr..addr + len).next().is_some()
    }

    /// Checks every structural invariant of the allocator. Panics on the
    /// first violation. Intended for tests and debugging; the runtime never
    /// calls it.
    pub(crate) fn validate(&self, lookup: &LookupMap<K, V>, counters: &Counters)
    where
        K: Ord,
    {
        assert!(
            self.chunks_size <= self.capacity,
            "footprint {} exceeds capacity {}",
            self.chunks_size,
            self.capacity
        );
        let mapped: usize = self.chunks.values().map(|chunk| chunk.len()).sum();
        assert_eq!(mapped, self.chunks_size);

        let mut allocated = 0usize;
        let mut in_use = 0usize;
        let mut free_seen = 0usize;
        let mut unused_seen = 0usize;
        let mut regions_seen = 0usize;

        for (id, chunk) in self.chunks.iter() {
            let start = chunk.addr();
            let end = start + chunk.len();
            let mut cursor = start;
            let mut prev_free = false;
            let mut pinned = 0usize;

            for (addr, region) in self.by_addr.range(start..end) {
                // SAFETY: allocator lock held.
                let geom = unsafe { region.geom() };
                assert_eq!(geom.chunk, *id, "region indexed under a foreign chunk");
                assert_eq!(*addr, geom.addr);
                assert!(*addr >= cursor, "regions must not overlap");
                assert!(geom.len % self.value_alignment == 0);
                let adjacent = *addr == cursor;
                cursor = *addr + geom.len;
                assert!(cursor <= end, "region extends past its chunk");
                regions_seen += 1;

                let refs = *region.refs().lock();
                match geom.state {
                    RegionState::Free => {
                        assert!(
                            !(prev_free && adjacent),
                            "adjacent free regions must be coalesced"
                        );
                        assert!(self.free.contains_key(&(geom.len, geom.addr)));
                        assert!(geom.lru_tick.is_none());
                        assert_eq!(refs, 0);
                        assert!(unsafe { region.slot() }.is_none());
                        free_seen += 1;
                    }
                    RegionState::Reserved => {
                        assert!(geom.lru_tick.is_none());
                        assert_eq!(refs, 0);
                        allocated += geom.len;
                    }
                    RegionState::Unused => {
                        let tick = geom.lru_tick.expect("unused region not queued");
                        assert!(self
                            .lru
                            .get(&tick)
                            .is_some_and(|current| Arc::ptr_eq(current, region)));
                        assert_eq!(refs, 0);
                        assert!(unsafe { region.slot() }.is_some());
                        allocated += geom.len;
                        unused_seen += 1;
                    }
                    RegionState::Used => {
                        assert!(refs > 0, "used region without a live handle");
                        assert!(geom.lru_tick.is_none());
                        assert!(unsafe { region.slot() }.is_some());
                        allocated += geom.len;
                        in_use += geom.len;
                        pinned += 1;
                    }
                }
                prev_free = geom.state == RegionState::Free;
            }

            assert_eq!(pinned, chunk.pinned(), "chunk pin count out of sync");
        }

        assert_eq!(regions_seen, self.by_addr.len());
        assert_eq!(free_seen, self.free.len());
        assert_eq!(unused_seen, self.lru.len());
        assert_eq!(allocated, self.allocated_size, "allocation accounting drifted");
        assert_eq!(
            in_use,
            counters.size_in_use.load(Ordering::Relaxed),
            "in-use accounting drifted"
        );

        for (key, region) in lookup {
            // SAFETY: allocator lock held.
            let geom = unsafe { region.geom() };
            assert!(matches!(
                geom.state,
                RegionState::Used | RegionState::Unused
            ));
            let slot = unsafe { region.slot() }.expect("indexed region without a slot");
            assert!(slot.key == *key, "lookup index key mismatch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::region::Slot;
    use crate::config::DEFAULT_MIN_CHUNK_SIZE;

    fn arena(capacity: usize) -> (Arena<u64, u64>, Mutex<LookupMap<u64, u64>>, Counters) {
        (
            Arena::new(capacity, 4096, 16, None, None),
            Mutex::new(LookupMap::new()),
            Counters::new(),
        )
    }

    /// Drives a reserved region through the slot fill and the used state, the
    /// way the cache layer does during an insertion.
    fn occupy(arena: &mut Arena<u64, u64>, region: &Arc<Region<u64, u64>>, key: u64) {
        unsafe { region.set_slot(Slot { key, value: key }) };
        *region.refs().lock() = 1;
        arena.mark_used(region);
    }

    fn demote(arena: &mut Arena<u64, u64>, region: &Arc<Region<u64, u64>>) {
        *region.refs().lock() = 0;
        arena.push_unused(region);
    }

    #[test]
    fn test_zero_request_is_refused() {
        let (mut arena, lookup, counters) = arena(DEFAULT_MIN_CHUNK_SIZE);
        assert!(arena.allocate(0, &lookup, &counters).unwrap().is_none());
        assert_eq!(arena.chunks(), 0);
        assert_eq!(arena.allocations, 0);
    }

    #[test]
    fn test_first_allocation_maps_a_chunk_and_splits_it() {
        let (mut arena, lookup, counters) = arena(16 * 1024);
        let region = arena.allocate(100, &lookup, &counters).unwrap().unwrap();

        // SAFETY: single-threaded test.
        let geom = unsafe { region.geom() };
        assert_eq!(geom.len, 112, "requests round up to the value alignment");
        assert_eq!(geom.state, RegionState::Reserved);
        assert_eq!(arena.chunks(), 1);
        assert_eq!(arena.chunks_size, 4096);
        assert_eq!(arena.allocated_size, 112);
        assert_eq!(arena.free_regions(), 1);
        assert_eq!(arena.regions(), 2);
    }

    #[test]
    fn test_exact_fit_consumes_the_free_region() {
        let (mut arena, lookup, counters) = arena(16 * 1024);
        let first = arena.allocate(1024, &lookup, &counters).unwrap().unwrap();
        let rest = arena.allocate(4096 - 1024, &lookup, &counters).unwrap().unwrap();

        assert_eq!(arena.free_regions(), 0);
        assert_eq!(arena.regions(), 2);
        assert_eq!(arena.allocated_size, 4096);
        // SAFETY: single-threaded test.
        unsafe {
            assert_eq!(first.geom().addr + first.geom().len, rest.geom().addr);
        }
    }

    #[test]
    fn test_growth_respects_the_capacity() {
        let (mut arena, lookup, counters) = arena(4096);
        let first = arena.allocate(4096, &lookup, &counters).unwrap().unwrap();
        // The cap is reached and nothing is evictable.
        assert!(arena.allocate(16, &lookup, &counters).unwrap().is_none());
        assert_eq!(arena.chunks_size, 4096);
        drop(first);
    }

    #[test]
    fn test_release_reserved_coalesces_neighbors() {
        let (mut arena, lookup, counters) = arena(16 * 1024);
        let a = arena.allocate(512, &lookup, &counters).unwrap().unwrap();
        let b = arena.allocate(512, &lookup, &counters).unwrap().unwrap();
        let c = arena.allocate(512, &lookup, &counters).unwrap().unwrap();
        assert_eq!(arena.regions(), 4);

        arena.release_reserved(&a);
        arena.release_reserved(&c);
        // c merges with the chunk remainder to its right; a stays separate
        // because b still sits between them.
        assert_eq!(arena.free_regions(), 2);

        arena.release_reserved(&b);
        // b bridges a, c and the chunk remainder into one span.
        assert_eq!(arena.free_regions(), 1);
        assert_eq!(arena.regions(), 1);
        assert_eq!(arena.allocated_size, 0);
        arena.validate(&lookup.lock(), &counters);
    }

    #[test]
    fn test_eviction_reclaims_the_lru_victim() {
        let (mut arena, lookup, counters) = arena(4096);
        let region = arena.allocate(4096, &lookup, &counters).unwrap().unwrap();
        occupy(&mut arena, &region, 1);
        lookup.lock().insert(1, region.clone());
        counters
            .size_in_use
            .store(4096, std::sync::atomic::Ordering::Relaxed);
        counters
            .size_initialized
            .store(4096, std::sync::atomic::Ordering::Relaxed);
        arena.validate(&lookup.lock(), &counters);

        demote(&mut arena, &region);
        counters
            .size_in_use
            .store(0, std::sync::atomic::Ordering::Relaxed);

        let replacement = arena.allocate(1024, &lookup, &counters).unwrap().unwrap();
        assert_eq!(arena.evictions, 1);
        assert_eq!(arena.evicted_bytes, 4096);
        assert!(lookup.lock().is_empty(), "the victim's key must be dropped");
        // SAFETY: single-threaded test.
        assert_eq!(unsafe { replacement.geom() }.len, 1024);
        arena.validate(&lookup.lock(), &counters);
    }

    #[test]
    fn test_secondary_eviction_merges_adjacent_unused_regions() {
        let (mut arena, lookup, counters) = arena(4096);
        let mut regions = Vec::new();
        for key in 0..4u64 {
            let region = arena.allocate(1024, &lookup, &counters).unwrap().unwrap();
            occupy(&mut arena, &region, key);
            lookup.lock().insert(key, region.clone());
            regions.push(region);
        }
        for region in &regions {
            demote(&mut arena, region);
        }
        counters
            .size_in_use
            .store(0, std::sync::atomic::Ordering::Relaxed);
        counters
            .size_initialized
            .store(4096, std::sync::atomic::Ordering::Relaxed);

        // One victim is too small; its unused right neighbor must follow.
        let merged = arena.allocate(2048, &lookup, &counters).unwrap().unwrap();
        assert_eq!(arena.evictions, 2);
        assert_eq!(arena.secondary_evictions, 1);
        // SAFETY: single-threaded test.
        assert_eq!(unsafe { merged.geom() }.len, 2048);
        arena.validate(&lookup.lock(), &counters);
    }

    #[test]
    fn test_shrink_drops_idle_state_and_keeps_pinned_chunks() {
        let (mut arena, lookup, counters) = arena(16 * 1024);
        let kept = arena.allocate(1024, &lookup, &counters).unwrap().unwrap();
        occupy(&mut arena, &kept, 1);
        lookup.lock().insert(1, kept.clone());
        counters
            .size_in_use
            .store(1024, std::sync::atomic::Ordering::Relaxed);

        let idle = arena.allocate(1024, &lookup, &counters).unwrap().unwrap();
        occupy(&mut arena, &idle, 2);
        lookup.lock().insert(2, idle.clone());
        demote(&mut arena, &idle);

        arena
            .shrink(&mut lookup.lock(), &counters, false)
            .unwrap();

        // The used region pins its chunk; the idle one is gone.
        assert_eq!(arena.chunks(), 1);
        assert_eq!(arena.regions(), 1);
        assert_eq!(arena.unused_regions(), 0);
        assert_eq!(arena.free_regions(), 0);
        assert_eq!(arena.allocated_size, 1024);
        assert_eq!(lookup.lock().len(), 1);
        arena.validate(&lookup.lock(), &counters);

        // Releasing the survivor afterwards makes the whole chunk reclaimable.
        demote(&mut arena, &kept);
        counters
            .size_in_use
            .store(0, std::sync::atomic::Ordering::Relaxed);
        arena
            .shrink(&mut lookup.lock(), &counters, true)
            .unwrap();
        assert_eq!(arena.chunks(), 0);
        assert_eq!(arena.regions(), 0);
        assert_eq!(arena.chunks_size, 0);
        assert_eq!(arena.allocations, 0);
        arena.validate(&lookup.lock(), &counters);
    }
}
