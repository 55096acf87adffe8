//! Hybrid distributed priority scheduling with drift-controlled placement.

use std::{
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::warn;

use crate::{
    config::{HdcpsConfig, OverflowPolicy},
    drift::DriftController,
    error::ConfigError,
    priority::{AtomicPriority, Indexer, Prioritized, Priority},
    thread_pool::PerThreadStorage,
    worklist::Worklist,
};

struct Local<K, T> {
    heap: BinaryHeap<Prioritized<K, T>>,
    /// Cycles through `0..dist_denominator`, one step per push.
    ctr: usize,
    /// The last thread that received a forwarded push.
    rr: usize,
}

struct HdcpsThread<K, T> {
    local: Mutex<Local<K, T>>,
    mailbox: ArrayQueue<Prioritized<K, T>>,
    latest_index: AtomicPriority<K>,
}

/// A distributed priority worklist that keeps most pushes local and forwards
/// the rest round-robin to peers' mailboxes.
///
/// The share kept local is the distribution factor out of
/// `dist_denominator`. A [`DriftController`] retunes the factor from the
/// measured priority drift: forwarding more evens out the keys threads work
/// on, keeping more saves communication.
///
/// A full mailbox is handled according to [`OverflowPolicy`].
pub struct Hdcps<T, K, I> {
    config: HdcpsConfig,
    indexer: I,
    threads: PerThreadStorage<HdcpsThread<K, T>>,
    controller: DriftController,
    dropped: AtomicU64,
}

impl<T, K, I> Hdcps<T, K, I>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
{
    pub fn new(config: HdcpsConfig, indexer: I) -> Result<Self, ConfigError> {
        config.validate()?;
        let threads = config.topology.threads();
        Ok(Hdcps {
            indexer,
            threads: PerThreadStorage::new(threads, |index| HdcpsThread {
                local: Mutex::new(Local {
                    heap: BinaryHeap::new(),
                    ctr: 0,
                    rr: index,
                }),
                mailbox: ArrayQueue::new(config.mailbox_capacity),
                latest_index: AtomicPriority::new(K::MIN),
            }),
            controller: DriftController::new(config.drift, threads),
            dropped: AtomicU64::new(0),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &HdcpsConfig {
        &self.config
    }

    #[inline]
    pub fn distribution_factor(&self) -> usize {
        self.controller.distribution_factor()
    }

    /// The smoothed priority drift estimate.
    #[inline]
    pub fn drift_estimate(&self) -> u64 {
        self.controller.monitor().estimate()
    }

    /// Returns the number of items lost to mailbox overwrites. Always zero
    /// under [`OverflowPolicy::Spill`].
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn push(&self, item: T) {
        let index = self.threads.local_index();
        let me = self.threads.remote(index);
        let entry = Prioritized {
            key: self.indexer.index(&item),
            order: self.config.order,
            item,
        };

        let mut local = me.local.lock();
        if let Some(pending) = me.mailbox.pop() {
            local.heap.push(pending);
        }

        let ctr = local.ctr;
        local.ctr = (ctr + 1) % self.config.dist_denominator;
        if ctr <= self.controller.distribution_factor() {
            local.heap.push(entry);
            return;
        }

        local.rr = (local.rr + 1) % self.threads.len();
        let target = local.rr;
        if target == index {
            local.heap.push(entry);
            return;
        }

        let mailbox = &self.threads.remote(target).mailbox;
        match self.config.overflow {
            OverflowPolicy::Spill => {
                if let Err(entry) = mailbox.push(entry) {
                    local.heap.push(entry);
                }
            }
            OverflowPolicy::Overwrite => {
                if mailbox.force_push(entry).is_some() {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(from = index, to = target, dropped, "mailbox full, overwrote oldest item");
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let index = self.threads.local_index();
        let me = self.threads.remote(index);

        let entry = {
            let mut local = me.local.lock();
            while let Some(pending) = me.mailbox.pop() {
                local.heap.push(pending);
            }
            local.heap.pop()
        };

        self.controller.on_pop(
            index,
            entry.as_ref().map(|entry| entry.key),
            &me.latest_index,
            |i| self.threads.remote(i).latest_index.load(),
        );
        entry.map(|entry| entry.item)
    }
}

impl<T, K, I> Worklist<T> for Hdcps<T, K, I>
where
    T: Send,
    K: Priority,
    I: Indexer<T, K>,
{
    fn push(&self, item: T) {
        Hdcps::push(self, item);
    }

    fn pop(&self) -> Option<T> {
        Hdcps::pop(self)
    }
}
