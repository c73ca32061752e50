//! Bounded per-control snapshot cache.
//!
//! Maps revision → snapshot with LRU eviction past a soft cap; the
//! current head snapshot is pinned in its own slot so eviction never
//! drops it. Per-revision async guards keep concurrent computes for the
//! same uncached revision down to one; late arrivals re-check the cache
//! after the guard and join the finished result.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;

use crate::change::Snapshot;
use crate::delta::Delta;
use crate::types::RevNum;

struct Inner<D: Delta> {
    lru: LruCache<RevNum, Snapshot<D>>,
    /// Pinned snapshot of the newest revision seen.
    head: Option<Snapshot<D>>,
    /// In-flight compute guards, keyed by revision.
    guards: HashMap<RevNum, Arc<AsyncMutex<()>>>,
}

/// Bounded revision→snapshot map.
pub struct SnapshotCache<D: Delta> {
    inner: Mutex<Inner<D>>,
}

impl<D: Delta> SnapshotCache<D> {
    /// A cache with the given soft cap (at least 1).
    pub fn new(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::new(cap),
                head: None,
                guards: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached snapshot for exactly `rev`, if any.
    pub fn get(&self, rev: RevNum) -> Option<Snapshot<D>> {
        let mut inner = self.lock();
        if let Some(head) = &inner.head {
            if head.rev_num == rev {
                return Some(head.clone());
            }
        }
        inner.lru.get(&rev).cloned()
    }

    /// The cached snapshot with the largest revision ≤ `rev`, if any.
    pub fn nearest_at_or_below(&self, rev: RevNum) -> Option<Snapshot<D>> {
        let inner = self.lock();
        let mut best: Option<&Snapshot<D>> = None;
        if let Some(head) = &inner.head {
            if head.rev_num <= rev {
                best = Some(head);
            }
        }
        for (cached_rev, snapshot) in inner.lru.iter() {
            if *cached_rev <= rev && best.map_or(true, |b| *cached_rev > b.rev_num) {
                best = Some(snapshot);
            }
        }
        best.cloned()
    }

    /// Store a snapshot. `is_head` pins it in the head slot (also taken
    /// when the revision outruns the pinned head).
    pub fn insert(&self, snapshot: Snapshot<D>, is_head: bool) {
        let mut inner = self.lock();
        inner.lru.put(snapshot.rev_num, snapshot.clone());
        let outruns = inner
            .head
            .as_ref()
            .map_or(true, |head| snapshot.rev_num >= head.rev_num);
        if is_head || outruns {
            inner.head = Some(snapshot);
        }
    }

    /// The compute guard for `rev`, creating it if needed. Hold its
    /// lock while producing the snapshot, then [`Self::release_guard`].
    pub fn guard(&self, rev: RevNum) -> Arc<AsyncMutex<()>> {
        let mut inner = self.lock();
        inner
            .guards
            .entry(rev)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the compute guard for `rev`.
    pub fn release_guard(&self, rev: RevNum) {
        self.lock().guards.remove(&rev);
    }

    /// Number of cached snapshots (excluding the pinned head slot).
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::BodyDelta;

    fn snap(rev: RevNum) -> Snapshot<BodyDelta> {
        Snapshot {
            rev_num: rev,
            contents: BodyDelta::document(&"x".repeat(rev as usize)),
        }
    }

    #[test]
    fn test_get_and_insert() {
        let cache = SnapshotCache::new(4);
        assert!(cache.get(3).is_none());
        cache.insert(snap(3), false);
        assert_eq!(cache.get(3).unwrap().rev_num, 3);
    }

    #[test]
    fn test_nearest_at_or_below() {
        let cache = SnapshotCache::new(8);
        cache.insert(snap(2), false);
        cache.insert(snap(5), false);
        cache.insert(snap(9), false);

        assert_eq!(cache.nearest_at_or_below(9).unwrap().rev_num, 9);
        assert_eq!(cache.nearest_at_or_below(8).unwrap().rev_num, 5);
        assert_eq!(cache.nearest_at_or_below(4).unwrap().rev_num, 2);
        assert!(cache.nearest_at_or_below(1).is_none());
    }

    #[test]
    fn test_eviction_respects_cap() {
        let cache = SnapshotCache::new(2);
        cache.insert(snap(1), false);
        cache.insert(snap(2), false);
        cache.insert(snap(3), false);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_head_survives_eviction() {
        let cache = SnapshotCache::new(2);
        cache.insert(snap(10), true);
        cache.insert(snap(11), false);
        cache.insert(snap(12), false);
        cache.insert(snap(13), false);

        // 10 fell out of the LRU but stays reachable via the head pin
        // until a newer head replaces it... 13 outran it, so 13 is head.
        assert_eq!(cache.nearest_at_or_below(9).map(|s| s.rev_num), None);
        assert_eq!(cache.get(13).unwrap().rev_num, 13);
    }

    #[test]
    fn test_head_pin_keeps_newest() {
        let cache = SnapshotCache::new(2);
        cache.insert(snap(5), true);
        // Older revisions never displace the pinned head.
        cache.insert(snap(3), false);
        cache.insert(snap(4), false);
        assert_eq!(cache.get(5).unwrap().rev_num, 5);
    }

    #[tokio::test]
    async fn test_guard_single_flight() {
        let cache: SnapshotCache<BodyDelta> = SnapshotCache::new(4);
        let guard = cache.guard(7);
        let held = guard.lock().await;

        let second = cache.guard(7);
        assert!(second.try_lock().is_err(), "same revision shares one guard");

        drop(held);
        cache.release_guard(7);
        let third = cache.guard(7);
        assert!(third.try_lock().is_ok());
    }
}
