//! # Concurrent Miss Coalescing Tests
//!
//! Verifies the single-producer guarantee: however many threads miss on the
//! same key at the same time, the size and init functors run exactly once and
//! every caller ends up with a handle to the same region.
//!
//! ## Test Goals
//!
//! 1. **Single production**: a hot key hammered by multiple threads is
//!    allocated and initialized once for the lifetime of the cache.
//! 2. **Blocking waiters**: threads that lose the production race receive the
//!    winner's handle, not an error and not a duplicate.
//! 3. **Failure retry**: a failed producer leaves nothing behind and the next
//!    caller produces from scratch.
//! 4. **No deadlocks**: release and lookup paths interleave freely with
//!    production under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use eyre::bail;
use regioncache::RegionCache;

#[test]
fn test_two_threads_hammering_one_key_allocate_once() {
    let cache: RegionCache<u64, u64> = RegionCache::builder()
        .capacity(64 * 1024 * 1024)
        .build()
        .unwrap();
    let init_calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let cache = cache.clone();
            let init_calls = Arc::clone(&init_calls);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 1..10_000 {
                    let (entry, _produced) = cache
                        .get_or_insert_with(
                            &1,
                            || Ok(4),
                            |payload| {
                                init_calls.fetch_add(1, Ordering::Relaxed);
                                payload.fill(0xC5);
                                Ok(1u64)
                            },
                        )
                        .unwrap();
                    let entry = entry.expect("a four byte value always fits");
                    assert_eq!(*entry, 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(init_calls.load(Ordering::Relaxed), 1);
    let stats = cache.stats();
    assert_eq!(stats.allocations, 1, "one region for the lifetime of the key");
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2 * 9_999 - 1);
    cache.validate();
}

#[test]
fn test_wide_miss_runs_the_producer_once() {
    const THREADS: usize = 8;

    let cache: RegionCache<u64, usize> = RegionCache::builder()
        .capacity(1024 * 1024)
        .build()
        .unwrap();
    let init_calls = Arc::new(AtomicUsize::new(0));
    let produced_count = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = cache.clone();
            let init_calls = Arc::clone(&init_calls);
            let produced_count = Arc::clone(&produced_count);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let (entry, produced) = cache
                    .get_or_insert_with(
                        &99,
                        || Ok(512),
                        |payload| {
                            init_calls.fetch_add(1, Ordering::Relaxed);
                            // Hold the other threads on the attempt long
                            // enough that they really queue up behind it.
                            thread::sleep(Duration::from_millis(50));
                            payload.fill(0x42);
                            Ok(payload.len())
                        },
                    )
                    .unwrap();
                if produced {
                    produced_count.fetch_add(1, Ordering::Relaxed);
                }
                let entry = entry.expect("512 bytes fit comfortably");
                assert_eq!(*entry, 512);
                assert!(entry.payload().iter().all(|byte| *byte == 0x42));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(init_calls.load(Ordering::Relaxed), 1);
    assert_eq!(produced_count.load(Ordering::Relaxed), 1);
    assert_eq!(cache.stats().allocations, 1);
    cache.validate();
}

#[test]
fn test_failed_production_is_not_cached_and_a_waiter_retries() {
    const THREADS: usize = 4;

    let cache: RegionCache<u64, u32> = RegionCache::builder()
        .capacity(1024 * 1024)
        .build()
        .unwrap();
    let attempts_made = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = cache.clone();
            let attempts_made = Arc::clone(&attempts_made);
            let successes = Arc::clone(&successes);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result = cache.get_or_insert_with(
                    &7,
                    || Ok(64),
                    |payload| {
                        // The very first producer fails; whoever retries
                        // succeeds.
                        if attempts_made.fetch_add(1, Ordering::SeqCst) == 0 {
                            bail!("backing store unavailable");
                        }
                        payload.fill(7);
                        Ok(7u32)
                    },
                );
                if let Ok((entry, _)) = result {
                    assert_eq!(*entry.unwrap(), 7);
                    successes.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Exactly one extra production ran after the failure, and every thread
    // that did not observe the error got the value.
    assert_eq!(attempts_made.load(Ordering::SeqCst), 2);
    assert_eq!(successes.load(Ordering::Relaxed), THREADS - 1);
    assert_eq!(*cache.get(&7).unwrap(), 7);
    cache.validate();
}

#[test]
fn test_mixed_keys_under_load_stay_consistent() {
    const THREADS: usize = 4;
    const OPS: usize = 3_000;

    let cache: RegionCache<u64, u64> = RegionCache::builder()
        .capacity(64 * 1024)
        .min_chunk_size(16 * 1024)
        .build()
        .unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS as u64)
        .map(|seed| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut state = seed * 2 + 1;
                for _ in 0..OPS {
                    // Cheap deterministic key stream per thread.
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let key = state >> 56;
                    let (entry, _) = cache
                        .get_or_insert_with(
                            &key,
                            || Ok(256),
                            |payload| {
                                payload.fill(key as u8);
                                Ok(key)
                            },
                        )
                        .unwrap();
                    if let Some(entry) = entry {
                        assert_eq!(*entry, key);
                        assert_eq!(entry.payload()[0], key as u8);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.chunks_size <= 64 * 1024);
    cache.validate();
}
