//! # Value Handles
//!
//! A [`CacheEntry`] is the user-facing, reference-counted view of a cached
//! value. While at least one entry for a region is alive, the region cannot
//! be evicted and its payload cannot move or be unmapped; dropping the last
//! entry demotes the region into the eviction queue, with the value kept
//! intact so a later lookup can revive it without re-running the producer.
//!
//! Entries keep the cache's shared state alive, so an entry that outlives the
//! cache value it came from remains fully usable.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use hashbrown::DefaultHashBuilder;

use crate::alloc::region::Region;

use super::Shared;

/// Shared handle to one cached value.
///
/// Cloning is cheap and bumps the region's reference count; dropping the last
/// clone makes the region evictable again.
pub struct CacheEntry<K, V, S = DefaultHashBuilder> {
    shared: Arc<Shared<K, V, S>>,
    region: Arc<Region<K, V>>,
}

impl<K, V, S> CacheEntry<K, V, S> {
    /// Wraps a region whose reference count the caller has already raised.
    pub(crate) fn new(shared: Arc<Shared<K, V, S>>, region: Arc<Region<K, V>>) -> Self {
        Self { shared, region }
    }

    /// The key this value is cached under.
    pub fn key(&self) -> &K {
        // SAFETY: a live handle freezes the slot.
        &unsafe { self.region.slot() }
            .expect("live cache entry without a slot") // INVARIANT: the slot is filled before any handle is issued
            .key
    }

    /// The cached value header.
    pub fn value(&self) -> &V {
        // SAFETY: a live handle freezes the slot.
        &unsafe { self.region.slot() }
            .expect("live cache entry without a slot") // INVARIANT: the slot is filled before any handle is issued
            .value
    }

    /// The raw payload span backing this value.
    pub fn payload(&self) -> &[u8] {
        // SAFETY: a live handle keeps the region used and its chunk mapped.
        unsafe { self.region.payload() }
    }

    /// Payload length in bytes (the requested size rounded up to the value
    /// alignment).
    pub fn len(&self) -> usize {
        // SAFETY: geometry of a used region is frozen.
        unsafe { self.region.geom() }.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many handles currently reference this region.
    pub fn ref_count(&self) -> usize {
        *self.region.refs().lock()
    }
}

impl<K, V, S> Clone for CacheEntry<K, V, S> {
    fn clone(&self) -> Self {
        // This handle keeps the count at one or more, so the region cannot be
        // demoted concurrently.
        *self.region.refs().lock() += 1;
        Self {
            shared: self.shared.clone(),
            region: self.region.clone(),
        }
    }
}

impl<K, V, S> Drop for CacheEntry<K, V, S> {
    fn drop(&mut self) {
        self.shared.release(&self.region);
    }
}

impl<K, V, S> Deref for CacheEntry<K, V, S> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<K, V, S> fmt::Debug for CacheEntry<K, V, S>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", self.key())
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_entry_is_send_sync() {
        is_send_sync::<CacheEntry<u64, Vec<u8>, DefaultHashBuilder>>();
    }
}
