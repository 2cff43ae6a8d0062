//! # regioncache - Memory-Bounded Region Cache
//!
//! A reference-counted object cache fused with an mmap-backed region
//! allocator, built for database servers that cache heterogeneous,
//! heap-indirecting objects: decoded blocks, dictionaries, compiled
//! expressions. The cache key and the value header live in ordinary heap
//! records; the value's bulk payload lives inside one of a few large
//! anonymous mappings owned by the cache.
//!
//! ## Why Fuse the Cache and the Allocator?
//!
//! - **One bound for everything**: the configured capacity limits mapped
//!   bytes, so allocator fragmentation counts against the budget instead of
//!   hiding outside it.
//! - **Eviction heals fragmentation**: when no free span fits, the cache
//!   evicts unreferenced values in LRU order and coalesces the freed
//!   neighbors until the request fits.
//! - **Reclaimed means reclaimed**: freed payload space goes back to the
//!   cache's own free index, not to a general-purpose allocator's bins.
//! - **Far-away placement**: chunks can be mapped at randomized hinted
//!   addresses, well away from the malloc heap, which makes stray-pointer
//!   stomps easier to catch.
//!
//! ## Quick Start
//!
//! ```ignore
//! use regioncache::RegionCache;
//!
//! let cache: RegionCache<u64, ()> = RegionCache::builder()
//!     .capacity(64 * 1024 * 1024)
//!     .value_alignment(64)
//!     .build()?;
//!
//! let (entry, _produced) = cache.get_or_insert_with(
//!     &block_id,
//!     || Ok(block_size(block_id)),
//!     |payload| {
//!         decode_block_into(block_id, payload)?;
//!         Ok(())
//!     },
//! )?;
//! let entry = entry.expect("capacity fits one block");
//! serve(entry.payload());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Public API (RegionCache, CacheEntry)     │
//! ├───────────────────────────────────────────────┤
//! │ Per-key insertion attempts (miss coalescing)  │
//! ├───────────────────────────────────────────────┤
//! │  Key lookup  │  Eviction queue  │ Accounting  │
//! ├───────────────────────────────────────────────┤
//! │ Region allocator (best fit, split, coalesce)  │
//! ├───────────────────────────────────────────────┤
//! │    Anonymous mmap chunks (unit of growth)     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`cache`]: public API, lookup and insertion paths, statistics
//! - `alloc`: chunks, region records, and the allocation engine
//! - [`config`]: page size, default chunk size and alignment
//! - [`tracker`]: memory accounting notifications for the embedder
//!
//! ## Guarantees at a Glance
//!
//! - Mapped footprint never exceeds the configured capacity.
//! - Concurrent misses for one key run the producer exactly once.
//! - A value referenced by a handle is never evicted or unmapped.
//! - Contents are in-memory only; nothing survives the process.

mod alloc;
pub mod cache;
pub mod config;
pub mod tracker;

pub use alloc::ChunkAddressHint;
pub use cache::{CacheEntry, CacheStats, CapacityTooSmall, RegionCache, RegionCacheBuilder};
pub use tracker::MemoryTracker;
