//! # Region Allocation Layer
//!
//! Everything below the cache API: mapped chunks, region records, the index
//! views over them, and the best-fit/evict/coalesce allocation engine. The
//! whole layer lives behind one mutex owned by the cache; nothing in here
//! locks it, every `&mut Arena` already proves it is held.
//!
//! - [`chunk`]: anonymous page-aligned mappings, the unit of growth
//! - [`region`]: per-span records holding key, value header, and refcount
//! - [`arena`]: the allocation engine and its four index views

pub(crate) mod arena;
pub(crate) mod chunk;
pub(crate) mod region;

pub use arena::ChunkAddressHint;
