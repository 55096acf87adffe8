//! The priority bucket index shared by the OBIM worklists.
//!
//! Every distinct priority key owns one bucket, recorded once in the
//! [`MasterLog`]. Threads never consult the log directly on the hot path.
//! Instead each one keeps a [`LocalView`]: a private ordered map from key to
//! bucket, replayed lazily from the log whenever the thread misses in it, plus
//! the bucket it is currently draining.
//!
//! All of the algorithms take the view explicitly so that a minnow worker can
//! run them on behalf of one of its producers.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    bucket::Bucket,
    config::ObimConfig,
    error::ConfigError,
    latch::Barrier,
    log::{BucketId, MasterLog},
    priority::{AtomicPriority, Indexer, Order, Priority},
    thread_pool::PerThreadStorage,
};

/// Marks an announcement without a bucket.
const NO_BUCKET: usize = usize::MAX;

// -----------------------------------------------------------------------------
// Per-thread state

/// A thread's private, lazily synchronized picture of the index.
pub struct LocalView<K, T> {
    /// Cached key to bucket map, in key order.
    local: BTreeMap<K, BucketId>,
    /// Number of log entries replayed into `local`.
    last_version: usize,
    cur_index: K,
    current: Option<BucketId>,
    num_pops: u32,
    /// Items pulled out by the barrier probe, waiting for their key to be
    /// adopted.
    stored: VecDeque<(K, T)>,
}

impl<K: Priority, T> LocalView<K, T> {
    fn new(identity: K) -> Self {
        LocalView {
            local: BTreeMap::new(),
            last_version: 0,
            cur_index: identity,
            current: None,
            num_pops: 0,
            stored: VecDeque::new(),
        }
    }

    /// The key of the bucket this thread is draining.
    #[inline]
    pub fn cur_index(&self) -> K {
        self.cur_index
    }

    #[inline]
    pub fn current(&self) -> Option<BucketId> {
        self.current
    }

    /// Returns the number of log entries this view has replayed.
    #[inline]
    pub fn last_version(&self) -> usize {
        self.last_version
    }

    /// Returns the cached bucket for `key`, if any.
    #[inline]
    pub fn cached(&self, key: K) -> Option<BucketId> {
        self.local.get(&key).copied()
    }

    /// Returns the number of cached buckets.
    #[inline]
    pub fn cached_len(&self) -> usize {
        self.local.len()
    }

    /// Returns the number of items staged by the barrier probe.
    #[inline]
    pub fn staged(&self) -> usize {
        self.stored.len()
    }

    fn take_stored(&mut self, key: K) -> Option<T> {
        let position = self.stored.iter().position(|(k, _)| *k == key)?;
        self.stored.remove(position).map(|(_, item)| item)
    }

    fn most_favorable_stored(&self, order: Order) -> Option<K> {
        self.stored
            .iter()
            .map(|(key, _)| *key)
            .reduce(|best, key| if order.precedes(key, best) { key } else { best })
    }
}

impl<K: fmt::Debug, T> fmt::Debug for LocalView<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalView")
            .field("cached", &self.local.len())
            .field("last_version", &self.last_version)
            .field("cur_index", &self.cur_index)
            .field("current", &self.current)
            .field("staged", &self.stored.len())
            .finish()
    }
}

/// Everything the index keeps per thread. The view is only ever locked by its
/// owner (or the minnow worker serving it), so the lock is uncontended; the
/// atomics are the parts peers read.
pub struct ThreadData<K, T> {
    pub(crate) view: Mutex<LocalView<K, T>>,
    /// Most favorable key this thread believes still has work.
    pub(crate) scan_start: AtomicPriority<K>,
    /// Published by the barrier probe before its first rendezvous.
    has_work: AtomicBool,
    announced_index: AtomicPriority<K>,
    announced_bucket: AtomicUsize,
    /// The last key popped while drift sampling was active.
    pub(crate) latest_index: AtomicPriority<K>,
}

impl<K: Priority, T> ThreadData<K, T> {
    fn new(identity: K) -> Self {
        ThreadData {
            view: Mutex::new(LocalView::new(identity)),
            scan_start: AtomicPriority::new(identity),
            has_work: AtomicBool::new(false),
            announced_index: AtomicPriority::new(identity),
            announced_bucket: AtomicUsize::new(NO_BUCKET),
            latest_index: AtomicPriority::new(K::MIN),
        }
    }

    #[inline]
    pub fn scan_start(&self) -> K {
        self.scan_start.load()
    }
}

// -----------------------------------------------------------------------------
// Bucket index

pub struct BucketIndex<T, K, I, C> {
    config: ObimConfig,
    indexer: I,
    data: PerThreadStorage<ThreadData<K, T>>,
    log: MasterLog<K, C>,
    barrier: Option<Barrier>,
    block_mask: u32,
}

impl<T, K, I, C> BucketIndex<T, K, I, C>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
    C: Bucket<T>,
{
    pub fn new(config: ObimConfig, indexer: I) -> Result<Self, ConfigError> {
        config.validate()?;
        let identity = config.order.identity::<K>();
        let threads = config.topology.threads();
        Ok(BucketIndex {
            indexer,
            data: PerThreadStorage::new(threads, |_| ThreadData::new(identity)),
            log: MasterLog::new(),
            barrier: config.barrier.then(|| Barrier::new(threads)),
            block_mask: ((1u64 << config.block_period) - 1) as u32,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &ObimConfig {
        &self.config
    }

    #[inline]
    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    #[inline]
    pub fn data(&self) -> &PerThreadStorage<ThreadData<K, T>> {
        &self.data
    }

    #[inline]
    pub fn log(&self) -> &MasterLog<K, C> {
        &self.log
    }

    /// Replays log entries the view has not seen yet. Returns `true` if any
    /// were replayed.
    fn refresh(&self, view: &mut LocalView<K, T>) -> bool {
        let mut last_version = view.last_version;
        for (id, entry) in self.log.replay(last_version) {
            view.local.insert(entry.key, id);
            last_version = id + 1;
        }
        let changed = last_version != view.last_version;
        view.last_version = last_version;
        changed
    }

    /// Finds the bucket for `key`, creating and logging it if no thread has
    /// done so yet.
    pub fn resolve(&self, view: &mut LocalView<K, T>, key: K) -> BucketId {
        if let Some(id) = view.cached(key) {
            return id;
        }

        // Keep replaying until the key shows up or we become the writer.
        let backoff = Backoff::new();
        let guard = loop {
            self.refresh(view);
            if let Some(id) = view.cached(key) {
                return id;
            }
            if let Some(guard) = self.log.try_write() {
                break guard;
            }
            backoff.snooze();
        };

        // Another writer may have logged the key just before we got the lock.
        self.refresh(view);
        if let Some(id) = view.cached(key) {
            return id;
        }

        let id = self.log.append(&guard, key, C::default());
        view.local.insert(key, id);
        view.last_version = id + 1;
        drop(guard);

        trace!(?key, bucket = id, "created bucket");
        id
    }

    /// Pushes `item` on behalf of thread `index`, whose view is `view`.
    pub fn push_for(&self, index: usize, view: &mut LocalView<K, T>, item: T) {
        let key = self.indexer.index(&item);
        let order = self.config.order;

        if self.config.monotonic {
            assert!(
                !order.precedes(key, view.cur_index),
                "monotonic worklist: thread {index} pushed key {key:?} ahead of its current key {:?}",
                view.cur_index
            );
        }

        // Fast path
        if let Some(current) = view.current {
            if key == view.cur_index {
                self.log.bucket(current).push(item);
                return;
            }
        }

        // Slow path
        let id = self.resolve(view, key);
        let data = self.data.remote(index);
        if self.config.back_scan_prevention && order.precedes(key, data.scan_start.load()) {
            data.scan_start.store(key);
        }
        // Opportunistically move to higher priority work.
        if !self.config.barrier && order.precedes(key, view.cur_index) {
            view.cur_index = key;
            view.current = Some(id);
        }
        self.log.bucket(id).push(item);
    }

    /// Pops on behalf of thread `index`, whose view is `view`.
    pub fn pop_for(&self, index: usize, view: &mut LocalView<K, T>) -> Option<T> {
        if self.config.barrier {
            let key = view.cur_index;
            if let Some(item) = view.take_stored(key) {
                return Some(item);
            }
        } else if self.config.block_period > 0 {
            let count = view.num_pops;
            view.num_pops = count.wrapping_add(1);
            if count & self.block_mask == 0 {
                return self.slow_pop(index, view);
            }
        }

        if let Some(current) = view.current {
            if let Some(item) = self.log.bucket(current).pop() {
                return Some(item);
            }
        }

        // Barrier mode only discovers new buckets in the collective probe.
        if self.config.barrier {
            return None;
        }

        self.slow_pop(index, view)
    }

    /// Returns the key rescans of thread `index` start from.
    fn scan_lower_bound(&self, index: usize) -> K {
        let order = self.config.order;
        if !self.config.back_scan_prevention || self.config.monotonic {
            return order.identity();
        }

        let topology = self.config.topology;
        let mut bound = self.data.remote(index).scan_start.load();
        if topology.is_leader(index) {
            for other in self.data.iter() {
                let start = other.scan_start.load();
                if order.precedes(start, bound) {
                    bound = start;
                }
            }
        } else {
            let start = self.data.remote(topology.leader_of(index)).scan_start.load();
            if order.precedes(start, bound) {
                bound = start;
            }
        }
        bound
    }

    /// Full rescan: pops from the most favorable non-empty cached bucket at or
    /// after the scan bound, and makes it the current bucket.
    pub fn slow_pop(&self, index: usize, view: &mut LocalView<K, T>) -> Option<T> {
        self.refresh(view);
        let from = self.scan_lower_bound(index);

        let try_bucket = |(&key, &id): (&K, &BucketId)| {
            self.log.bucket(id).pop().map(|item| (key, id, item))
        };
        let (key, id, item) = match self.config.order {
            Order::Ascending => view.local.range(from..).find_map(try_bucket),
            Order::Descending => view.local.range(..=from).rev().find_map(try_bucket),
        }?;

        view.current = Some(id);
        view.cur_index = key;
        self.data.remote(index).scan_start.store(key);
        Some(item)
    }

    /// Stages `item` under `key` for thread `index`, as the barrier probe
    /// does with whatever its rescan finds.
    fn stage(view: &mut LocalView<K, T>, key: K, item: T) {
        view.stored.push_back((key, item));
    }

    /// The collective barrier-mode probe. Every thread must call it for the
    /// round to complete. Returns `true` iff no thread found any work.
    ///
    /// # Panics
    ///
    /// Panics if the index was not configured for barrier mode.
    pub fn empty(&self, index: usize) -> bool {
        let Some(barrier) = &self.barrier else {
            panic!("empty() requires a worklist configured with barrier mode");
        };
        let order = self.config.order;
        let data = self.data.remote(index);

        // Phase 1: look for work locally and announce the best staged key.
        {
            let mut view = data.view.lock();
            if let Some(item) = self.slow_pop(index, &mut view) {
                let key = view.cur_index;
                Self::stage(&mut view, key, item);
            }
            match view.most_favorable_stored(order) {
                Some(key) => {
                    let bucket = view.cached(key).unwrap_or(NO_BUCKET);
                    data.announced_index.store(key);
                    data.announced_bucket.store(bucket, Ordering::Relaxed);
                    data.has_work.store(true, Ordering::Relaxed);
                }
                None => data.has_work.store(false, Ordering::Relaxed),
            }
        }

        // Phase 2
        barrier.wait();

        // Phase 3: everyone picks the same most favorable announcement. Ties
        // go to the lowest thread index.
        let mut adopted: Option<(K, usize)> = None;
        let mut has_work = false;
        for other in self.data.iter() {
            if !other.has_work.load(Ordering::Relaxed) {
                continue;
            }
            has_work = true;
            let key = other.announced_index.load();
            if adopted.map_or(true, |(best, _)| order.precedes(key, best)) {
                adopted = Some((key, other.announced_bucket.load(Ordering::Relaxed)));
            }
        }

        // Phase 4: nobody may overwrite an announcement until all have read.
        barrier.wait();

        if let Some((key, bucket)) = adopted {
            let mut view = data.view.lock();
            view.cur_index = key;
            view.current = (bucket != NO_BUCKET).then_some(bucket);
            if self.config.monotonic {
                view.local.retain(|&cached, _| !order.precedes(cached, key));
            }
        }

        !has_work
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bucket::SegFifo, thread_pool::{ThreadPool, Topology}};

    type Index = BucketIndex<u32, u32, fn(&u32) -> u32, SegFifo<u32>>;

    fn identity(item: &u32) -> u32 {
        *item
    }

    fn index(config: ObimConfig) -> Index {
        BucketIndex::new(config, identity as fn(&u32) -> u32).unwrap()
    }

    #[test]
    fn resolve_is_unique_per_key() {
        let index = index(ObimConfig::new(Topology::new(2)));
        let mut a = LocalView::new(0u32);
        let mut b = LocalView::new(0u32);

        let first = index.resolve(&mut a, 7);
        assert_eq!(index.resolve(&mut b, 7), first);
        assert_eq!(index.resolve(&mut a, 7), first);
        assert_eq!(index.log().version(), 1);

        let second = index.resolve(&mut b, 9);
        assert_ne!(second, first);
        assert_eq!(index.log().version(), 2);

        // `a` learns about key 9 by replaying the log, not by creating it.
        assert_eq!(index.resolve(&mut a, 9), second);
        assert_eq!(a.last_version(), 2);
        assert_eq!(index.log().version(), 2);
    }

    #[test]
    fn push_jumps_to_more_favorable_keys() {
        let index = index(ObimConfig::new(Topology::new(1)));
        let mut view = LocalView::new(0u32);
        index.slow_pop(0, &mut view);

        // Nothing precedes the identity, so the first push does not jump.
        index.push_for(0, &mut view, 5);
        assert_eq!(view.current(), None);

        assert_eq!(index.pop_for(0, &mut view), Some(5));
        assert_eq!(view.cur_index(), 5);

        index.push_for(0, &mut view, 3);
        assert_eq!(view.cur_index(), 3);
        index.push_for(0, &mut view, 4);
        assert_eq!(view.cur_index(), 3);
        assert_eq!(index.pop_for(0, &mut view), Some(3));
        assert_eq!(index.pop_for(0, &mut view), Some(4));
        assert_eq!(index.pop_for(0, &mut view), None);
    }

    #[test]
    fn back_scan_prevention_skips_exhausted_keys() {
        let index = index(ObimConfig::new(Topology::new(1)));
        let mut view = LocalView::new(0u32);
        for key in [1, 2, 3] {
            index.push_for(0, &mut view, key);
        }
        assert_eq!(index.pop_for(0, &mut view), Some(1));
        assert_eq!(index.data().remote(0).scan_start(), 1);
        assert_eq!(index.pop_for(0, &mut view), Some(2));
        assert_eq!(index.data().remote(0).scan_start(), 2);

        // Pushing a more favorable key widens the scan start again.
        index.push_for(0, &mut view, 0);
        assert_eq!(index.data().remote(0).scan_start(), 0);
    }

    #[test]
    fn block_period_forces_rescans() {
        let config = ObimConfig::new(Topology::new(1))
            .with_block_period(1)
            .with_back_scan_prevention(false);
        let index = index(config);
        let mut view = LocalView::new(0u32);
        for item in [10, 10, 10] {
            index.push_for(0, &mut view, item);
        }
        // First pop is a forced rescan and selects bucket 10.
        assert_eq!(index.pop_for(0, &mut view), Some(10));

        // A more favorable key appears in a bucket this view has not seen.
        let mut other = LocalView::new(0u32);
        let id = index.resolve(&mut other, 1);
        index.log().bucket(id).push(1);

        // The second pop drains the current bucket; the third is a forced
        // rescan and finds key 1.
        assert_eq!(index.pop_for(0, &mut view), Some(10));
        assert_eq!(index.pop_for(0, &mut view), Some(1));
        assert_eq!(index.pop_for(0, &mut view), Some(10));
    }

    #[test]
    fn descending_order_serves_largest_first() {
        let config = ObimConfig::new(Topology::new(1)).with_order(Order::Descending);
        let index = index(config);
        let mut view = LocalView::new(u32::MAX);
        for key in [4, 9, 1] {
            index.push_for(0, &mut view, key);
        }
        let popped: Vec<_> = std::iter::from_fn(|| index.pop_for(0, &mut view)).collect();
        assert_eq!(popped, vec![9, 4, 1]);
    }

    #[test]
    #[should_panic(expected = "monotonic worklist")]
    fn monotonic_rejects_backwards_push() {
        let config = ObimConfig::new(Topology::new(1)).with_monotonic(true);
        let index = index(config);
        let mut view = LocalView::new(0u32);
        index.push_for(0, &mut view, 5);
        assert_eq!(index.pop_for(0, &mut view), Some(5));
        index.push_for(0, &mut view, 4);
    }

    #[test]
    #[should_panic(expected = "barrier mode")]
    fn empty_requires_barrier_mode() {
        index(ObimConfig::new(Topology::new(1))).empty(0);
    }

    #[test]
    fn barrier_round_adopts_most_favorable_staged_key() {
        let config = ObimConfig::new(Topology::new(2)).with_barrier(true);
        let index = index(config);
        let pool = ThreadPool::new(Topology::new(2)).unwrap();

        // Thread 0 has staged key 3 and thread 1 key 7; the buckets are empty.
        for (thread, key) in [(0, 3u32), (1, 7u32)] {
            let mut view = index.data().remote(thread).view.lock();
            index.resolve(&mut view, key);
            Index::stage(&mut view, key, key);
        }

        let rounds = pool.broadcast(|worker| {
            let me = worker.index();
            let mut trace = Vec::new();

            assert!(!index.empty(me));
            trace.push(index.data().remote(me).view.lock().cur_index());
            trace.extend(index.pop_for(me, &mut index.data().remote(me).view.lock()));

            // Round two: key 3 is gone, thread 1 still holds key 7.
            assert!(!index.empty(me));
            trace.push(index.data().remote(me).view.lock().cur_index());
            trace.extend(index.pop_for(me, &mut index.data().remote(me).view.lock()));

            assert!(index.empty(me));
            trace
        });

        assert_eq!(rounds[0], vec![3, 3, 7]);
        assert_eq!(rounds[1], vec![3, 7, 7]);
    }

    #[test]
    fn monotonic_barrier_round_evicts_passed_buckets() {
        let config = ObimConfig::new(Topology::new(1))
            .with_barrier(true)
            .with_monotonic(true);
        let index = index(config);
        let pool = ThreadPool::new(Topology::new(1)).unwrap();

        pool.broadcast(|_| {
            {
                let mut view = index.data().remote(0).view.lock();
                for key in [1, 2, 3] {
                    let id = index.resolve(&mut view, key);
                    index.log().bucket(id).push(key);
                }
            }
            // Key 1 is popped and staged; key 1 is adopted.
            assert!(!index.empty(0));
            assert_eq!(index.pop_for(0, &mut index.data().remote(0).view.lock()), Some(1));
            assert_eq!(index.pop_for(0, &mut index.data().remote(0).view.lock()), None);

            // Key 2 is adopted and key 1 falls out of the cache.
            assert!(!index.empty(0));
            let view = index.data().remote(0).view.lock();
            assert_eq!(view.cur_index(), 2);
            assert_eq!(view.cached(1), None);
            assert!(view.cached(2).is_some());
            assert_eq!(view.cached_len(), 2);
        });
    }
}
