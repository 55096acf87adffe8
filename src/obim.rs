//! The ordered-by-integer-metric worklist.

use crate::{
    bucket::{Bucket, SegFifo},
    config::ObimConfig,
    drift::DriftMonitor,
    error::ConfigError,
    index::BucketIndex,
    priority::{Indexer, Priority},
    worklist::Worklist,
};

/// A scalable approximate priority worklist.
///
/// Items are grouped into one bucket per key. Each thread works through the
/// most favorable bucket it knows about, and only occasionally synchronizes
/// its picture of which buckets exist. Items are therefore served roughly,
/// not strictly, in priority order. How roughly depends on the scan policy
/// chosen in [`ObimConfig`].
///
/// ```
/// use obim::prelude::*;
///
/// let topology = Topology::new(2);
/// let pool = ThreadPool::new(topology).unwrap();
/// let worklist: OrderedByIntegerMetric<u32, u32, _> =
///     OrderedByIntegerMetric::new(ObimConfig::new(topology), |x: &u32| *x / 10).unwrap();
///
/// let popped = pool.broadcast(|worker| {
///     let start = worker.index() as u32 * 100;
///     worklist.push_initial(start..start + 100);
///     std::iter::from_fn(|| worklist.pop()).count()
/// });
/// assert!(popped.iter().sum::<usize>() <= 200);
/// ```
pub struct OrderedByIntegerMetric<T, K, I, C = SegFifo<T>> {
    index: BucketIndex<T, K, I, C>,
    drift: DriftMonitor,
}

impl<T, K, I, C> OrderedByIntegerMetric<T, K, I, C>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
    C: Bucket<T>,
{
    pub fn new(config: ObimConfig, indexer: I) -> Result<Self, ConfigError> {
        let index = BucketIndex::new(config, indexer)?;
        Ok(OrderedByIntegerMetric {
            drift: DriftMonitor::new(config.drift, config.topology.threads()),
            index,
        })
    }

    #[inline]
    pub fn config(&self) -> &ObimConfig {
        self.index.config()
    }

    /// The underlying bucket index, for inspection.
    #[inline]
    pub fn index(&self) -> &BucketIndex<T, K, I, C> {
        &self.index
    }

    /// Returns the number of buckets created so far.
    #[inline]
    pub fn buckets(&self) -> usize {
        self.index.log().version()
    }

    /// The smoothed priority drift estimate.
    #[inline]
    pub fn drift_estimate(&self) -> u64 {
        self.drift.estimate()
    }

    pub fn push(&self, item: T) {
        let index = self.index.data().local_index();
        let mut view = self.index.data().remote(index).view.lock();
        self.index.push_for(index, &mut view, item);
    }

    /// Pushes many items while holding the caller's view once.
    pub fn push_all<It>(&self, items: It)
    where
        It: IntoIterator<Item = T>,
    {
        let index = self.index.data().local_index();
        let mut view = self.index.data().remote(index).view.lock();
        for item in items {
            self.index.push_for(index, &mut view, item);
        }
    }

    pub fn push_initial<It>(&self, items: It)
    where
        It: IntoIterator<Item = T>,
    {
        self.push_all(items);
    }

    pub fn pop(&self) -> Option<T> {
        let index = self.index.data().local_index();
        let data = self.index.data().remote(index);
        let item = self.index.pop_for(index, &mut data.view.lock());

        let key = match &item {
            Some(item) if self.drift.is_sampling() => Some(self.index.indexer().index(item)),
            _ => None,
        };
        self.drift.on_pop(index, key, &data.latest_index, |i| {
            self.index.data().remote(i).latest_index.load()
        });
        item
    }

    /// The collective probe of barrier mode. Every pool thread must call it;
    /// it returns `true` on all of them iff no thread found any work, and
    /// otherwise moves every thread to the same most favorable key.
    ///
    /// # Panics
    ///
    /// Panics unless the worklist was configured with barrier mode.
    pub fn empty(&self) -> bool {
        self.index.empty(self.index.data().local_index())
    }
}

impl<T, K, I, C> Worklist<T> for OrderedByIntegerMetric<T, K, I, C>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
    C: Bucket<T>,
{
    fn push(&self, item: T) {
        OrderedByIntegerMetric::push(self, item);
    }

    fn pop(&self) -> Option<T> {
        OrderedByIntegerMetric::pop(self)
    }

    fn push_all<It>(&self, items: It)
    where
        It: IntoIterator<Item = T>,
        Self: Sized,
    {
        OrderedByIntegerMetric::push_all(self, items);
    }
}
