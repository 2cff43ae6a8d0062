//! # Region Records
//!
//! A region is a contiguous byte span inside exactly one chunk, described by
//! a heap-allocated record. The record holds the span geometry, the cached
//! key and value header, and the reference count. The value *header* lives in
//! the record; only the value's indirected payload (for example a vector's
//! element buffer) lives inside the mapped span. Stack-only values with no
//! heap indirection gain nothing from this cache.
//!
//! ## States
//!
//! ```text
//! Free     ── not holding data; indexed by size for best-fit allocation;
//!             candidate for coalescing with adjacent free neighbors.
//! Reserved ── carved out for an in-flight insertion; reachable only through
//!             the address index while the producer initializes the payload.
//! Unused   ── key and value are initialized but nothing references them;
//!             queued for eviction in LRU order, revivable by key lookup.
//! Used     ── at least one handle is alive; never evicted.
//! ```
//!
//! ## Interior Partitioning
//!
//! Records are shared between handles and the cache, so their fields are
//! partitioned by the lock that guards them:
//!
//! - `refs` is guarded by the record's own mutex (the per-region lock),
//! - `geom` (addr, len, chunk, state, LRU position) is guarded by the
//!   allocator lock,
//! - `slot` (key + value header) is written only while the record is
//!   Reserved or being destroyed, and is read freely by handles while the
//!   reference count is positive.
//!
//! The `unsafe` accessors encode those contracts; callers state which lock
//! they hold. Geometry of a Used region is never mutated, which is what makes
//! lock-free payload access from handles sound.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;

use super::chunk::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionState {
    Free,
    Reserved,
    Unused,
    Used,
}

/// Span geometry and index linkage. Guarded by the allocator lock.
pub(crate) struct Geometry {
    pub(crate) addr: usize,
    pub(crate) len: usize,
    pub(crate) chunk: ChunkId,
    pub(crate) state: RegionState,
    /// Position in the eviction queue; `Some` exactly while Unused.
    pub(crate) lru_tick: Option<u64>,
}

/// The cached key and value header.
pub(crate) struct Slot<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
}

pub(crate) struct Region<K, V> {
    /// Count of live handles. Guarded by this mutex alone, so releasing a
    /// handle on a hot region does not touch the allocator lock.
    refs: Mutex<usize>,
    slot: UnsafeCell<Option<Slot<K, V>>>,
    geom: UnsafeCell<Geometry>,
}

// SAFETY: all access to the UnsafeCell fields goes through the accessors
// below, whose contracts serialize writers behind the allocator lock and
// restrict shared reads to states where no writer can exist.
unsafe impl<K: Send, V: Send> Send for Region<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Region<K, V> {}

impl<K, V> Region<K, V> {
    pub(crate) fn new(addr: usize, len: usize, chunk: ChunkId, state: RegionState) -> Arc<Self> {
        Arc::new(Self {
            refs: Mutex::new(0),
            slot: UnsafeCell::new(None),
            geom: UnsafeCell::new(Geometry {
                addr,
                len,
                chunk,
                state,
                lru_tick: None,
            }),
        })
    }

    pub(crate) fn refs(&self) -> &Mutex<usize> {
        &self.refs
    }

    /// # Safety
    ///
    /// The caller must hold the allocator lock, or hold a handle to this
    /// region (Used geometry is frozen until the last handle is released).
    pub(crate) unsafe fn geom(&self) -> &Geometry {
        unsafe { &*self.geom.get() }
    }

    /// # Safety
    ///
    /// The caller must hold the allocator lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn geom_mut(&self) -> &mut Geometry {
        unsafe { &mut *self.geom.get() }
    }

    /// # Safety
    ///
    /// The caller must hold a handle to this region (the slot is frozen while
    /// the reference count is positive), or hold the allocator lock.
    pub(crate) unsafe fn slot(&self) -> Option<&Slot<K, V>> {
        unsafe { (*self.slot.get()).as_ref() }
    }

    /// # Safety
    ///
    /// The caller must exclusively own the region in the Reserved state: no
    /// handle exists and no index other than the address index reaches it.
    pub(crate) unsafe fn set_slot(&self, slot: Slot<K, V>) {
        let cell = unsafe { &mut *self.slot.get() };
        debug_assert!(cell.is_none());
        *cell = Some(slot);
    }

    /// # Safety
    ///
    /// The caller must hold the allocator lock and the reference count must
    /// be zero, so no handle can be reading the slot.
    pub(crate) unsafe fn take_slot(&self) -> Option<Slot<K, V>> {
        unsafe { (*self.slot.get()).take() }
    }

    /// Payload span of this region.
    ///
    /// # Safety
    ///
    /// The caller must hold a handle to this region, or own it in the
    /// Reserved state. Either way the chunk is mapped and the span is not
    /// concurrently resized.
    pub(crate) unsafe fn payload(&self) -> &[u8] {
        let geom = unsafe { self.geom() };
        unsafe { std::slice::from_raw_parts(geom.addr as *const u8, geom.len) }
    }

    /// Mutable payload span, for the producer filling a Reserved region.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the region in the Reserved state.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self) -> &mut [u8] {
        let geom = unsafe { self.geom() };
        unsafe { std::slice::from_raw_parts_mut(geom.addr as *mut u8, geom.len) }
    }
}
