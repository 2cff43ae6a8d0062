//! # Memory Chunks
//!
//! A chunk is one anonymous, private, page-aligned memory mapping. Chunks are
//! the unit of growth for the cache: when no free region can satisfy a
//! request and the footprint cap still has room, the allocator maps a new
//! chunk and carves regions out of it. Chunks are never split or resized;
//! they are unmapped as a whole once nothing inside them is referenced.
//!
//! ## Placement Hints
//!
//! The embedding application may supply an address-hint source. The hint is
//! passed to `mmap` as the preferred placement address; the kernel is free to
//! ignore it. Placing cache memory far away from the general-purpose heap
//! helps reveal stray writes, since a stomping pointer is unlikely to land in
//! a mapping at a randomized remote address.
//!
//! ## Pin Counting
//!
//! Each chunk tracks how many referenced regions are rooted in it. The count
//! decides whether `shrink_to_fit` may unmap the chunk. The counter only
//! counts regions handed out to users; free and evictable regions do not pin
//! their chunk.
//!
//! ## Error Handling
//!
//! `mmap` and `munmap` failures surface as `eyre` reports wrapping the OS
//! error. A failed unmap leaks the mapping; the chunk is considered gone
//! either way so the failure is reported once and never retried.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{Result, WrapErr};

use crate::config::PAGE_SIZE;
use crate::tracker::MemoryTracker;

/// Identifies one mapped chunk for the lifetime of the cache.
///
/// Ids are monotonic and never reused, so a region can always tell whether a
/// neighbor lives in the same mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChunkId(pub(crate) u64);

pub(crate) struct MemoryChunk {
    addr: *mut u8,
    len: usize,
    /// How many referenced regions are rooted in this chunk.
    pinned: AtomicUsize,
    tracker: Option<Arc<dyn MemoryTracker>>,
}

// SAFETY: the raw pointer is owned by the chunk and only dereferenced through
// region payloads, which carry their own synchronization. The atomic counter
// and the tracker are thread-safe by construction.
unsafe impl Send for MemoryChunk {}
unsafe impl Sync for MemoryChunk {}

impl MemoryChunk {
    /// Maps `len` bytes of anonymous private memory, preferably at `hint`.
    ///
    /// `len` must be a non-zero multiple of the page size. A zero `hint`
    /// leaves placement entirely to the kernel.
    pub(crate) fn map(
        len: usize,
        hint: usize,
        tracker: Option<Arc<dyn MemoryTracker>>,
    ) -> Result<Self> {
        debug_assert!(len > 0 && len % PAGE_SIZE == 0);

        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        // Pre-faulting the pages trades mapping latency for the first reads
        // being cheap; cache payloads are written immediately after mapping.
        #[cfg(target_os = "linux")]
        let flags = flags | libc::MAP_POPULATE;

        // SAFETY: plain anonymous mapping request. This is safe because:
        // 1. No file descriptor is involved (fd = -1, MAP_ANONYMOUS)
        // 2. The hint is advisory; without MAP_FIXED the kernel never
        //    clobbers an existing mapping
        // 3. The result is checked against MAP_FAILED before use
        let addr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error())
                .wrap_err_with(|| format!("failed to map a {} byte cache chunk", len));
        }

        if let Some(tracker) = tracker.as_ref() {
            tracker.mapped(len);
        }

        tracing::debug!(len, addr = addr as usize, "mapped cache chunk");

        Ok(Self {
            addr: addr.cast(),
            len,
            pinned: AtomicUsize::new(0),
            tracker,
        })
    }

    pub(crate) fn addr(&self) -> usize {
        self.addr as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn pin(&self) {
        self.pinned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pinned.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned chunk");
    }

    pub(crate) fn pinned(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    /// Unmaps the chunk. Idempotent; the first failure is final.
    pub(crate) fn release(&mut self) -> Result<()> {
        if self.addr.is_null() {
            return Ok(());
        }

        let addr = std::mem::replace(&mut self.addr, std::ptr::null_mut());

        // SAFETY: munmap of a range this chunk mapped itself. This is safe
        // because:
        // 1. `addr` and `len` are exactly what mmap returned
        // 2. The address is nulled first, so the range is never unmapped twice
        // 3. Callers only release chunks with no referenced regions inside
        let rc = unsafe { libc::munmap(addr.cast(), self.len) };
        if rc != 0 {
            return Err(io::Error::last_os_error())
                .wrap_err_with(|| format!("failed to unmap a {} byte cache chunk", self.len));
        }

        if let Some(tracker) = self.tracker.as_ref() {
            tracker.unmapped(self.len);
        }

        tracing::debug!(len = self.len, "unmapped cache chunk");

        Ok(())
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::error!("leaked cache chunk on drop: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTracker {
        mapped: AtomicUsize,
        unmapped: AtomicUsize,
    }

    impl MemoryTracker for CountingTracker {
        fn mapped(&self, bytes: usize) {
            self.mapped.fetch_add(bytes, Ordering::Relaxed);
        }

        fn unmapped(&self, bytes: usize) {
            self.unmapped.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_chunk_map_write_release() {
        let mut chunk = MemoryChunk::map(2 * PAGE_SIZE, 0, None).unwrap();
        assert_eq!(chunk.len(), 2 * PAGE_SIZE);
        assert_eq!(chunk.addr() % PAGE_SIZE, 0);

        // SAFETY: the chunk owns the whole range and nothing else writes it.
        unsafe {
            std::ptr::write_bytes(chunk.addr() as *mut u8, 0xAB, chunk.len());
            assert_eq!(*(chunk.addr() as *const u8), 0xAB);
        }

        chunk.release().unwrap();
        chunk.release().unwrap();
    }

    #[test]
    fn test_chunk_notifies_tracker() {
        let tracker = Arc::new(CountingTracker {
            mapped: AtomicUsize::new(0),
            unmapped: AtomicUsize::new(0),
        });

        let chunk = MemoryChunk::map(PAGE_SIZE, 0, Some(tracker.clone() as _)).unwrap();
        assert_eq!(tracker.mapped.load(Ordering::Relaxed), PAGE_SIZE);
        assert_eq!(tracker.unmapped.load(Ordering::Relaxed), 0);

        drop(chunk);
        assert_eq!(tracker.unmapped.load(Ordering::Relaxed), PAGE_SIZE);
    }

    #[test]
    fn test_chunk_pin_counting() {
        let chunk = MemoryChunk::map(PAGE_SIZE, 0, None).unwrap();
        assert_eq!(chunk.pinned(), 0);
        chunk.pin();
        chunk.pin();
        assert_eq!(chunk.pinned(), 2);
        chunk.unpin();
        assert_eq!(chunk.pinned(), 1);
    }
}
