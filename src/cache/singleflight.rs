//! # Insertion Attempts
//!
//! When several threads miss on the same key at once, only one of them may
//! run the user's size and init functors; the rest must wait for that result
//! instead of stampeding the allocator with duplicate work. This module
//! coordinates that: every missing thread joins a per-key attempt record and
//! serializes on its mutex. The first thread through the mutex produces the
//! value and stashes the resulting handle in the attempt; everyone queued
//! behind it wakes up, finds the handle, and returns it as a concurrent hit.
//!
//! ## Failure Semantics
//!
//! A producer failure is never cached. The failing thread leaves the attempt
//! empty and propagates its error; the next waiter through the mutex finds no
//! value and becomes the producer itself, retrying from scratch.
//!
//! ## Lifetime
//!
//! Attempts live in a map keyed by the cache key. Each waiter holds an
//! [`AttemptGuard`]; the last guard released removes the attempt from the
//! map. All waiter-count transitions happen under the map mutex, so a thread
//! can never join an attempt that is concurrently being removed. Removal
//! compares identity before erasing, so a stale guard cannot remove a newer
//! attempt that reuses the same key.

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::handle::CacheEntry;

pub(crate) type AttemptMap<K, V, S> = HashMap<K, Arc<Attempt<K, V, S>>, S>;

/// One in-flight insertion for one key.
pub(crate) struct Attempt<K, V, S> {
    /// Serializes the waiters. Held for the whole production, so waiters
    /// block here until the producer finishes or fails.
    pub(crate) gate: Mutex<Option<CacheEntry<K, V, S>>>,
    /// Guards still interested in this attempt. Only mutated under the
    /// attempt-map mutex.
    waiters: AtomicUsize,
    disposed: AtomicBool,
}

impl<K, V, S> Attempt<K, V, S> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(None),
            waiters: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }
}

/// A waiter's stake in an attempt. Releasing the last stake removes the
/// attempt from the map; dropping the guard releases implicitly.
pub(crate) struct AttemptGuard<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    attempts: &'a Mutex<AttemptMap<K, V, S>>,
    key: &'a K,
    attempt: Arc<Attempt<K, V, S>>,
    released: bool,
}

impl<'a, K, V, S> AttemptGuard<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Joins (or creates) the attempt for `key`.
    pub(crate) fn join(attempts: &'a Mutex<AttemptMap<K, V, S>>, key: &'a K) -> Self
    where
        K: Clone,
    {
        let attempt = {
            let mut map = attempts.lock();
            let attempt = map
                .entry(key.clone())
                .or_insert_with(Attempt::new)
                .clone();
            debug_assert!(!attempt.disposed.load(Ordering::Relaxed));
            attempt.waiters.fetch_add(1, Ordering::Relaxed);
            attempt
        };
        Self {
            attempts,
            key,
            attempt,
            released: false,
        }
    }

    pub(crate) fn attempt(&self) -> &Arc<Attempt<K, V, S>> {
        &self.attempt
    }

    /// Gives up this stake. Idempotent. Must not be called while the
    /// attempt's own mutex is held.
    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut map = self.attempts.lock();
        if self.attempt.waiters.fetch_sub(1, Ordering::Relaxed) == 1 {
            if map
                .get(self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.attempt))
            {
                map.remove(self.key);
            }
            self.attempt.disposed.store(true, Ordering::Relaxed);
        }
    }
}

impl<K, V, S> Drop for AttemptGuard<'_, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn drop(&mut self) {
        self.release();
    }
}
