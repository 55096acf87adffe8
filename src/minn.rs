//! The producer/minnow split of the bucket index.
//!
//! The first `N - M` threads of the pool are producers. They never touch the
//! bucket index themselves: a push lands in the producer's enqueue mailbox and
//! a pop reads its dequeue mailbox. The last `M` threads are minnow workers.
//! Each one owns a contiguous range of producers and shuttles work between
//! their mailboxes and the index, running the index algorithms on the
//! producers' views.

use std::ops::Range;

use crossbeam_utils::Backoff;
use tracing::debug;

use crate::{
    bucket::{Bucket, SegFifo},
    config::MinnConfig,
    drift::DriftMonitor,
    error::ConfigError,
    index::BucketIndex,
    latch::AtomicLatch,
    list::LinkedQueue,
    priority::{Indexer, Priority},
    thread_pool::PerThreadStorage,
    worklist::Worklist,
};

struct Mailbox<T> {
    /// Producer to worker.
    enqueue: LinkedQueue<T>,
    /// Worker to producer.
    dequeue: LinkedQueue<T>,
    retired: AtomicLatch,
}

impl<T> Mailbox<T> {
    fn new() -> Self {
        Mailbox {
            enqueue: LinkedQueue::new(),
            dequeue: LinkedQueue::new(),
            retired: AtomicLatch::new(),
        }
    }
}

/// An [`OrderedByIntegerMetric`] whose index is maintained by dedicated
/// worker threads.
///
/// On a producer thread, `push` and `pop` only touch that thread's mailboxes.
/// On a minnow worker, `pop` serves the worker's producers until they have
/// all [retired](Self::retire) with nothing left to forward, or until the
/// worklist is [shut down](Self::shutdown), and then returns `None`.
///
/// [`OrderedByIntegerMetric`]: crate::obim::OrderedByIntegerMetric
pub struct OrderedByIntegerMetricMinn<T, K, I, C = SegFifo<T>> {
    config: MinnConfig,
    index: BucketIndex<T, K, I, C>,
    mailboxes: PerThreadStorage<Mailbox<T>>,
    shutdown: AtomicLatch,
    drift: DriftMonitor,
}

impl<T, K, I, C> OrderedByIntegerMetricMinn<T, K, I, C>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
    C: Bucket<T>,
{
    pub fn new(config: MinnConfig, indexer: I) -> Result<Self, ConfigError> {
        config.validate()?;
        let producers = config.producers();
        Ok(OrderedByIntegerMetricMinn {
            index: BucketIndex::new(config.obim, indexer)?,
            mailboxes: PerThreadStorage::new(producers, |_| Mailbox::new()),
            shutdown: AtomicLatch::new(),
            drift: DriftMonitor::new(config.obim.drift, producers),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &MinnConfig {
        &self.config
    }

    #[inline]
    pub fn producers(&self) -> usize {
        self.config.producers()
    }

    /// Returns `true` if thread `index` is a minnow worker.
    #[inline]
    pub fn is_minnow(&self, index: usize) -> bool {
        index >= self.producers()
    }

    /// The smoothed priority drift estimate, measured over producers.
    #[inline]
    pub fn drift_estimate(&self) -> u64 {
        self.drift.estimate()
    }

    /// Returns the producers served by minnow worker `worker`, counting
    /// workers from zero. Producers are split evenly; the first
    /// `producers % minnows` workers take one extra.
    pub fn owned_producers(&self, worker: usize) -> Range<usize> {
        let producers = self.producers();
        let workers = self.config.minnow_threads;
        let base = producers / workers;
        let extra = producers % workers;
        let start = worker * base + worker.min(extra);
        let len = base + usize::from(worker < extra);
        start..start + len
    }

    /// Returns the calling thread's index, which must be a producer's.
    fn producer_index(&self, operation: &str) -> usize {
        let index = self.index.data().local_index();
        assert!(
            !self.is_minnow(index),
            "minnow worker {index} cannot {operation}; only producers can"
        );
        index
    }

    /// Hands `item` to the caller's minnow worker.
    ///
    /// # Panics
    ///
    /// Panics when called from a minnow worker.
    pub fn push(&self, item: T) {
        let index = self.producer_index("push");
        self.mailboxes.remote(index).enqueue.push(item);
    }

    pub fn push_all<It>(&self, items: It)
    where
        It: IntoIterator<Item = T>,
    {
        let index = self.producer_index("push");
        let mailbox = self.mailboxes.remote(index);
        for item in items {
            mailbox.enqueue.push(item);
        }
    }

    /// Seeds the worklist. Only the items given on thread 0 are used.
    pub fn push_initial<It>(&self, items: It)
    where
        It: IntoIterator<Item = T>,
    {
        if self.index.data().local_index() == 0 {
            self.push_all(items);
        }
    }

    /// On a producer, takes the next item its worker forwarded. On a minnow
    /// worker, serves until termination and returns `None`.
    pub fn pop(&self) -> Option<T> {
        let index = self.index.data().local_index();
        if self.is_minnow(index) {
            self.serve(index - self.producers());
            return None;
        }

        let item = self.mailboxes.remote(index).dequeue.pop();
        let key = match &item {
            Some(item) if self.drift.is_sampling() => Some(self.index.indexer().index(item)),
            _ => None,
        };
        let data = self.index.data();
        self.drift.on_pop(index, key, &data.remote(index).latest_index, |i| {
            data.remote(i).latest_index.load()
        });
        item
    }

    /// Tells the caller's worker that this producer will neither push nor pop
    /// again. Does nothing on a minnow worker.
    pub fn retire(&self) {
        let index = self.index.data().local_index();
        if !self.is_minnow(index) {
            self.mailboxes.remote(index).retired.set();
        }
    }

    /// Stops every minnow worker at the end of its current sweep, whether or
    /// not its producers have retired.
    pub fn shutdown(&self) {
        self.shutdown.set();
    }

    /// The minnow worker loop.
    fn serve(&self, worker: usize) {
        let owned = self.owned_producers(worker);
        debug!(worker, producers = ?owned, "minnow worker started");

        let backoff = Backoff::new();
        let mut sweeps = 0u64;
        loop {
            let mut progress = false;
            let mut finished = true;
            for producer in owned.clone() {
                let mailbox = self.mailboxes.remote(producer);
                // Read before draining, so that every push made before
                // retiring is forwarded in this sweep.
                let retired = mailbox.retired.probe();

                let mut view = self.index.data().remote(producer).view.lock();
                while let Some(item) = mailbox.enqueue.pop() {
                    self.index.push_for(producer, &mut view, item);
                    progress = true;
                }
                // A retired producer will never read its dequeue mailbox.
                if !retired {
                    if let Some(item) = self.index.pop_for(producer, &mut view) {
                        mailbox.dequeue.push(item);
                        progress = true;
                    }
                }

                finished &= retired && mailbox.enqueue.is_empty();
            }
            sweeps += 1;

            if finished || self.shutdown.probe() {
                break;
            }
            if progress {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }

        debug!(worker, sweeps, "minnow worker stopped");
    }
}

impl<T, K, I, C> Worklist<T> for OrderedByIntegerMetricMinn<T, K, I, C>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
    C: Bucket<T>,
{
    fn push(&self, item: T) {
        OrderedByIntegerMetricMinn::push(self, item);
    }

    fn pop(&self) -> Option<T> {
        OrderedByIntegerMetricMinn::pop(self)
    }

    fn push_initial<It>(&self, items: It)
    where
        It: IntoIterator<Item = T>,
        Self: Sized,
    {
        OrderedByIntegerMetricMinn::push_initial(self, items);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        config::ObimConfig,
        thread_pool::{ThreadPool, Topology},
    };

    type Minn = OrderedByIntegerMetricMinn<u32, u32, fn(&u32) -> u32>;

    fn by_value(x: &u32) -> u32 {
        *x
    }

    fn minn(threads: usize, minnows: usize) -> Minn {
        let config = MinnConfig::new(ObimConfig::new(Topology::new(threads)), minnows);
        OrderedByIntegerMetricMinn::new(config, by_value as fn(&u32) -> u32).unwrap()
    }

    #[test]
    fn producers_split_evenly() {
        let worklist = minn(8, 3);
        assert_eq!(worklist.producers(), 5);
        assert_eq!(worklist.owned_producers(0), 0..2);
        assert_eq!(worklist.owned_producers(1), 2..4);
        assert_eq!(worklist.owned_producers(2), 4..5);

        let worklist = minn(3, 2);
        assert_eq!(worklist.owned_producers(0), 0..1);
        assert_eq!(worklist.owned_producers(1), 1..1);
    }

    #[test]
    fn rejects_barrier_mode() {
        let obim = ObimConfig::new(Topology::new(2)).with_barrier(true);
        let result = OrderedByIntegerMetricMinn::<u32, u32, _>::new(
            MinnConfig::new(obim, 1),
            by_value as fn(&u32) -> u32,
        );
        assert!(matches!(result, Err(ConfigError::MinnBarrier)));
    }

    #[test]
    fn worker_serves_until_producers_retire() {
        let pool = ThreadPool::new(Topology::new(3)).unwrap();
        let worklist = minn(3, 1);
        let total = AtomicUsize::new(0);

        let received = pool.broadcast(|worker| {
            let mut received = Vec::new();
            if worklist.is_minnow(worker.index()) {
                assert_eq!(worklist.pop(), None);
                return received;
            }

            // Buckets are shared, so either producer may receive any item.
            let base = worker.index() as u32 * 1000;
            worklist.push_all(base..base + 50);
            let backoff = Backoff::new();
            while total.load(Ordering::Acquire) < 100 {
                match worklist.pop() {
                    Some(item) => {
                        received.push(item);
                        total.fetch_add(1, Ordering::AcqRel);
                    }
                    None => backoff.snooze(),
                }
            }
            worklist.retire();
            received
        });

        assert!(received[2].is_empty());
        let mut all: Vec<_> = received.concat();
        all.sort_unstable();
        let expected: Vec<_> = (0..50).chain(1000..1050).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn shutdown_stops_workers() {
        let pool = ThreadPool::new(Topology::new(2)).unwrap();
        let worklist = minn(2, 1);

        pool.broadcast(|worker| {
            if worklist.is_minnow(worker.index()) {
                assert_eq!(worklist.pop(), None);
            } else {
                worklist.push(1);
                worklist.shutdown();
            }
        });
    }

    #[test]
    #[should_panic(expected = "cannot push")]
    fn workers_cannot_push() {
        let pool = ThreadPool::new(Topology::new(2)).unwrap();
        let worklist = minn(2, 1);
        pool.broadcast(|worker| {
            if worklist.is_minnow(worker.index()) {
                worklist.push(1);
            }
        });
    }
}
