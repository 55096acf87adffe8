//! Priority drift: how far apart the keys being processed by different
//! threads are at a given moment.
//!
//! Measurement is driven entirely by one coordinator thread. Every
//! `sample_after` of its pops it opens a short sampling window during which
//! every thread publishes the key it last popped; when the window closes the
//! coordinator sums the distances between its own key and everybody else's.
//! The [`DriftMonitor`] keeps a smoothed estimate of that sum. The
//! [`DriftController`] additionally feeds each measurement into a hysteresis
//! rule that tunes the distribution factor of the `Hdcps` worklist.
//!
//! All shared state is held in `Relaxed` atomics. Only the coordinator writes
//! it; other threads may observe updates late, which merely delays when they
//! start or stop sampling or pick up a new distribution factor.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::{
    config::DriftConfig,
    priority::{AtomicPriority, Priority},
};

// -----------------------------------------------------------------------------
// Monitor

pub struct DriftMonitor {
    config: DriftConfig,
    /// Threads `0..participants` are compared against the coordinator.
    participants: usize,
    sampling: AtomicBool,
    /// Coordinator pops since the last measurement.
    counter: AtomicU32,
    estimate: AtomicU64,
    last: AtomicU64,
    measurements: AtomicU64,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig, participants: usize) -> Self {
        DriftMonitor {
            config,
            participants,
            sampling: AtomicBool::new(false),
            counter: AtomicU32::new(0),
            estimate: AtomicU64::new(0),
            last: AtomicU64::new(0),
            measurements: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Returns `true` while threads should publish the keys they pop.
    #[inline]
    pub fn is_sampling(&self) -> bool {
        self.sampling.load(Ordering::Relaxed)
    }

    /// The smoothed drift estimate: each measurement is averaged with the
    /// previous estimate.
    #[inline]
    pub fn estimate(&self) -> u64 {
        self.estimate.load(Ordering::Relaxed)
    }

    /// The most recent raw measurement.
    #[inline]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn measurements(&self) -> u64 {
        self.measurements.load(Ordering::Relaxed)
    }

    /// Advances the coordinator's pop count, opening and closing the sampling
    /// window. Returns `true` when the window has just closed and a
    /// measurement is due.
    pub fn tick(&self) -> bool {
        let count = self.counter.load(Ordering::Relaxed).saturating_add(1);
        if count >= self.config.sample_after && !self.is_sampling() {
            self.sampling.store(true, Ordering::Relaxed);
        }
        if count >= self.config.sample_after.saturating_add(self.config.sample_window) {
            self.sampling.store(false, Ordering::Relaxed);
            self.counter.store(0, Ordering::Relaxed);
            return true;
        }
        self.counter.store(count, Ordering::Relaxed);
        false
    }

    /// Records a measurement given the coordinator's latest key and every
    /// other participant's. Returns the raw drift.
    pub fn measure<K, I>(&self, own: K, others: I) -> u64
    where
        K: Priority,
        I: IntoIterator<Item = K>,
    {
        let drift = others
            .into_iter()
            .fold(0u64, |sum, key| sum.saturating_add(own.distance(key)));
        let estimate = self.estimate().saturating_add(drift) / 2;
        self.estimate.store(estimate, Ordering::Relaxed);
        self.last.store(drift, Ordering::Relaxed);
        self.measurements.fetch_add(1, Ordering::Relaxed);
        debug!(drift, estimate, "priority drift measured");
        drift
    }

    /// Bookkeeping for one pop by thread `index`.
    ///
    /// `slot` is the calling thread's published latest key and `latest_of`
    /// reads any participant's. Returns the new measurement when this pop
    /// closed a sampling window on the coordinator.
    pub fn on_pop<K, F>(
        &self,
        index: usize,
        popped: Option<K>,
        slot: &AtomicPriority<K>,
        latest_of: F,
    ) -> Option<u64>
    where
        K: Priority,
        F: Fn(usize) -> K,
    {
        if let Some(key) = popped {
            if self.is_sampling() {
                slot.store(key);
            }
        }
        if index != self.config.coordinator || !self.tick() {
            return None;
        }
        let others = (0..self.participants)
            .filter(|&i| i != index)
            .map(latest_of);
        Some(self.measure(slot.load(), others))
    }
}

// -----------------------------------------------------------------------------
// Controller

/// Tunes the distribution factor from successive drift measurements.
///
/// The controller remembers which way it last moved the factor. When drift
/// stops improving it reverses direction; while drift keeps improving it
/// keeps going the same way. The factor is clamped to
/// `[floor, ceiling]`.
pub struct DriftController {
    monitor: DriftMonitor,
    factor: AtomicUsize,
    /// `true` when the last adjustment lowered the factor.
    decreasing: AtomicBool,
    has_baseline: AtomicBool,
    previous: AtomicU64,
}

impl DriftController {
    pub fn new(config: DriftConfig, participants: usize) -> Self {
        DriftController {
            factor: AtomicUsize::new(config.initial_factor),
            monitor: DriftMonitor::new(config, participants),
            decreasing: AtomicBool::new(false),
            has_baseline: AtomicBool::new(false),
            previous: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn monitor(&self) -> &DriftMonitor {
        &self.monitor
    }

    /// The current distribution factor. Larger values keep more pushes local.
    #[inline]
    pub fn distribution_factor(&self) -> usize {
        self.factor.load(Ordering::Relaxed)
    }

    /// Like [`DriftMonitor::on_pop`], additionally adjusting the factor after
    /// each measurement.
    pub fn on_pop<K, F>(
        &self,
        index: usize,
        popped: Option<K>,
        slot: &AtomicPriority<K>,
        latest_of: F,
    ) -> Option<u64>
    where
        K: Priority,
        F: Fn(usize) -> K,
    {
        let drift = self.monitor.on_pop(index, popped, slot, latest_of)?;
        self.adjust(drift);
        Some(drift)
    }

    /// Feeds one drift measurement into the controller and returns the new
    /// distribution factor. The first measurement only sets the baseline.
    pub fn adjust(&self, drift: u64) -> usize {
        let factor = self.distribution_factor();
        if !self.has_baseline.swap(true, Ordering::Relaxed) {
            self.previous.store(drift, Ordering::Relaxed);
            return factor;
        }

        let previous = self.previous.swap(drift, Ordering::Relaxed);
        let config = self.monitor.config();
        let raise = (factor + 1).min(config.ceiling);
        let lower = factor.saturating_sub(1).max(config.floor);

        let stalled = drift >= previous;
        let decreasing = self.decreasing.load(Ordering::Relaxed);
        let (next, decreasing) = match (stalled, decreasing) {
            (true, true) | (false, false) => (raise, false),
            (true, false) | (false, true) => (lower, true),
        };

        self.factor.store(next, Ordering::Relaxed);
        self.decreasing.store(decreasing, Ordering::Relaxed);
        debug!(drift, previous, factor = next, "distribution factor adjusted");
        next
    }
}
