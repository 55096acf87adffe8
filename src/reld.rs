//! Random enqueue, local dequeue.

use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::{
    config::ReldConfig,
    drift::DriftMonitor,
    error::ConfigError,
    priority::{AtomicPriority, Indexer, Order, Prioritized, Priority},
    thread_pool::{PerThreadStorage, WorkerThread},
    worklist::Worklist,
};

struct ReldQueue<K, T> {
    heap: Mutex<BinaryHeap<Prioritized<K, T>>>,
    latest_index: AtomicPriority<K>,
}

/// A distributed priority worklist: every thread owns a private priority
/// queue, pushes go to a uniformly random thread's queue, and pops only ever
/// look at the caller's own.
///
/// Random placement spreads high priority work across the pool without any
/// global structure, at the cost of a thread sometimes working on a key far
/// from the globally most favorable one.
pub struct Reld<T, K, I> {
    config: ReldConfig,
    indexer: I,
    queues: PerThreadStorage<ReldQueue<K, T>>,
    drift: DriftMonitor,
}

impl<T, K, I> Reld<T, K, I>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
{
    pub fn new(config: ReldConfig, indexer: I) -> Result<Self, ConfigError> {
        config.validate()?;
        let threads = config.topology.threads();
        Ok(Reld {
            indexer,
            queues: PerThreadStorage::new(threads, |_| ReldQueue {
                heap: Mutex::new(BinaryHeap::new()),
                latest_index: AtomicPriority::new(K::MIN),
            }),
            drift: DriftMonitor::new(config.drift, threads),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &ReldConfig {
        &self.config
    }

    #[inline]
    pub fn order(&self) -> Order {
        self.config.order
    }

    /// The smoothed priority drift estimate.
    #[inline]
    pub fn drift_estimate(&self) -> u64 {
        self.drift.estimate()
    }

    /// Returns the number of items queued at thread `index`.
    pub fn queued(&self, index: usize) -> usize {
        self.queues.remote(index).heap.lock().len()
    }

    pub fn push(&self, item: T) {
        let index = self.queues.local_index();
        let threads = self.queues.len();
        let target = WorkerThread::with_current(|worker| match worker {
            Some(worker) => worker.rng().next_usize(threads),
            None => index,
        });

        let entry = Prioritized {
            key: self.indexer.index(&item),
            order: self.config.order,
            item,
        };
        self.queues.remote(target).heap.lock().push(entry);
    }

    pub fn pop(&self) -> Option<T> {
        let index = self.queues.local_index();
        let queue = self.queues.remote(index);
        let entry = queue.heap.lock().pop();

        self.drift.on_pop(
            index,
            entry.as_ref().map(|entry| entry.key),
            &queue.latest_index,
            |i| self.queues.remote(i).latest_index.load(),
        );
        entry.map(|entry| entry.item)
    }
}

impl<T, K, I> Worklist<T> for Reld<T, K, I>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
{
    fn push(&self, item: T) {
        Reld::push(self, item);
    }

    fn pop(&self) -> Option<T> {
        Reld::pop(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::thread_pool::{ThreadPool, Topology};

    #[test]
    fn single_thread_is_a_priority_queue() {
        let topology = Topology::new(1);
        let pool = ThreadPool::new(topology).unwrap();
        let reld = Reld::new(
            ReldConfig::new(topology).with_order(Order::Descending),
            |x: &i64| *x,
        )
        .unwrap();

        let popped = pool.broadcast(|_| {
            reld.push_all([3, -8, 12, 0, 7]);
            std::iter::from_fn(|| reld.pop()).collect::<Vec<_>>()
        });
        assert_eq!(popped[0], vec![12, 7, 3, 0, -8]);
    }

    #[test]
    fn pushes_spread_over_threads() {
        let topology = Topology::new(4);
        let pool = ThreadPool::new(topology).unwrap();
        let reld = Reld::new(ReldConfig::new(topology), |x: &u32| *x).unwrap();

        pool.broadcast(|worker| {
            if worker.index() == 0 {
                reld.push_all(0..400);
            }
        });
        let total: usize = (0..4).map(|i| reld.queued(i)).sum();
        assert_eq!(total, 400);
        assert!((0..4).filter(|&i| reld.queued(i) > 0).count() > 1);

        let popped = AtomicUsize::new(0);
        pool.broadcast(|_| {
            let mut previous = None;
            while let Some(item) = reld.pop() {
                // No pushes happen concurrently, so each queue drains in order.
                assert!(previous.map_or(true, |previous| previous < item));
                previous = Some(item);
                popped.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(popped.load(Ordering::Relaxed), 400);
    }
}
