//! Construction-time configuration for every worklist.
//!
//! Configurations are plain values with builder-style setters. None of them
//! can be changed once a worklist has been built; validation happens in the
//! worklist constructors.

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, priority::Order, thread_pool::Topology};

/// The largest supported block period. The pop counter is a `u32`, so a
/// period of `2^31` is already far beyond anything useful.
pub const MAX_BLOCK_PERIOD: u32 = 31;

// -----------------------------------------------------------------------------
// Drift

/// Settings for priority drift measurement and the distribution factor
/// controller.
///
/// The coordinator thread counts its own pops. After `sample_after` pops every
/// thread starts recording the key it last popped; `sample_window` pops later
/// the coordinator compares those keys, records a drift measurement, and
/// starts counting again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftConfig {
    pub coordinator: usize,
    pub sample_after: u32,
    pub sample_window: u32,
    pub floor: usize,
    pub ceiling: usize,
    pub initial_factor: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            coordinator: 0,
            sample_after: 2000,
            sample_window: 200,
            floor: 3,
            ceiling: 8,
            initial_factor: 8,
        }
    }
}

impl DriftConfig {
    pub fn with_sampling(self, sample_after: u32, sample_window: u32) -> Self {
        DriftConfig {
            sample_after,
            sample_window,
            ..self
        }
    }

    pub fn with_bounds(self, floor: usize, ceiling: usize) -> Self {
        DriftConfig {
            floor,
            ceiling,
            ..self
        }
    }

    pub fn with_initial_factor(self, initial_factor: usize) -> Self {
        DriftConfig {
            initial_factor,
            ..self
        }
    }

    pub fn with_coordinator(self, coordinator: usize) -> Self {
        DriftConfig {
            coordinator,
            ..self
        }
    }

    pub fn validate(&self, topology: &Topology) -> Result<(), ConfigError> {
        if self.sample_window == 0 {
            return Err(ConfigError::ZeroSampleWindow);
        }
        if self.floor > self.ceiling
            || self.initial_factor < self.floor
            || self.initial_factor > self.ceiling
        {
            return Err(ConfigError::DriftBounds {
                floor: self.floor,
                initial: self.initial_factor,
                ceiling: self.ceiling,
            });
        }
        if self.coordinator >= topology.threads() {
            return Err(ConfigError::CoordinatorOutOfRange {
                coordinator: self.coordinator,
                threads: topology.threads(),
            });
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Bucket index (OBIM)

/// Scan policy and shape of an [`OrderedByIntegerMetric`] worklist.
///
/// [`OrderedByIntegerMetric`]: crate::obim::OrderedByIntegerMetric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObimConfig {
    pub topology: Topology,
    pub order: Order,
    /// Bound rescans by the most favorable key any thread is known to be
    /// working on.
    pub back_scan_prevention: bool,
    /// Advance priority levels in lockstep through the collective `empty()`
    /// probe.
    pub barrier: bool,
    /// Promise that no thread pushes work more favorable than its current
    /// key, which lets the index evict exhausted buckets.
    pub monotonic: bool,
    /// Force a full rescan every `2^block_period` pops. Zero disables.
    pub block_period: u32,
    pub drift: DriftConfig,
}

impl ObimConfig {
    pub fn new(topology: Topology) -> Self {
        ObimConfig {
            topology,
            order: Order::Ascending,
            back_scan_prevention: true,
            barrier: false,
            monotonic: false,
            block_period: 0,
            drift: DriftConfig::default(),
        }
    }

    pub fn with_order(self, order: Order) -> Self {
        ObimConfig { order, ..self }
    }

    pub fn with_back_scan_prevention(self, back_scan_prevention: bool) -> Self {
        ObimConfig {
            back_scan_prevention,
            ..self
        }
    }

    pub fn with_barrier(self, barrier: bool) -> Self {
        ObimConfig { barrier, ..self }
    }

    pub fn with_monotonic(self, monotonic: bool) -> Self {
        ObimConfig { monotonic, ..self }
    }

    pub fn with_block_period(self, block_period: u32) -> Self {
        ObimConfig {
            block_period,
            ..self
        }
    }

    pub fn with_drift(self, drift: DriftConfig) -> Self {
        ObimConfig { drift, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()?;
        if self.block_period > MAX_BLOCK_PERIOD {
            return Err(ConfigError::BlockPeriodTooLarge {
                period: self.block_period,
                max: MAX_BLOCK_PERIOD,
            });
        }
        self.drift.validate(&self.topology)
    }
}

impl Default for ObimConfig {
    fn default() -> Self {
        ObimConfig::new(Topology::default())
    }
}

// -----------------------------------------------------------------------------
// Producer / minnow split

/// Shape of an [`OrderedByIntegerMetricMinn`] worklist: the last
/// `minnow_threads` threads of the topology serve the bucket index on behalf
/// of the others.
///
/// [`OrderedByIntegerMetricMinn`]: crate::minn::OrderedByIntegerMetricMinn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinnConfig {
    pub obim: ObimConfig,
    pub minnow_threads: usize,
}

impl MinnConfig {
    pub fn new(obim: ObimConfig, minnow_threads: usize) -> Self {
        MinnConfig {
            obim,
            minnow_threads,
        }
    }

    /// Returns the number of producer threads.
    #[inline]
    pub fn producers(&self) -> usize {
        self.obim.topology.threads() - self.minnow_threads
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.obim.validate()?;
        let threads = self.obim.topology.threads();
        if self.minnow_threads == 0 || self.minnow_threads >= threads {
            return Err(ConfigError::MinnowSplit {
                threads,
                minnows: self.minnow_threads,
            });
        }
        if self.obim.barrier {
            return Err(ConfigError::MinnBarrier);
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Distributed variants

/// Shape of a [`Reld`] worklist.
///
/// [`Reld`]: crate::reld::Reld
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReldConfig {
    pub topology: Topology,
    pub order: Order,
    pub drift: DriftConfig,
}

impl ReldConfig {
    pub fn new(topology: Topology) -> Self {
        ReldConfig {
            topology,
            order: Order::Ascending,
            drift: DriftConfig::default(),
        }
    }

    pub fn with_order(self, order: Order) -> Self {
        ReldConfig { order, ..self }
    }

    pub fn with_drift(self, drift: DriftConfig) -> Self {
        ReldConfig { drift, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()?;
        self.drift.validate(&self.topology)
    }
}

/// What an HDCPS push does when the chosen peer's mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Keep the item in the pusher's own queue instead. Nothing is lost.
    #[default]
    Spill,
    /// Overwrite the oldest undelivered mailbox entry. The displaced item is
    /// dropped and counted.
    Overwrite,
}

/// Shape of an [`Hdcps`] worklist.
///
/// [`Hdcps`]: crate::hdcps::Hdcps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdcpsConfig {
    pub topology: Topology,
    pub order: Order,
    pub mailbox_capacity: usize,
    /// The push counter cycles through `0..dist_denominator`; pushes whose
    /// counter is at most the distribution factor stay local.
    pub dist_denominator: usize,
    pub overflow: OverflowPolicy,
    pub drift: DriftConfig,
}

impl HdcpsConfig {
    pub fn new(topology: Topology) -> Self {
        HdcpsConfig {
            topology,
            order: Order::Ascending,
            mailbox_capacity: 512,
            dist_denominator: 10,
            overflow: OverflowPolicy::Spill,
            drift: DriftConfig::default(),
        }
    }

    pub fn with_order(self, order: Order) -> Self {
        HdcpsConfig { order, ..self }
    }

    pub fn with_mailbox_capacity(self, mailbox_capacity: usize) -> Self {
        HdcpsConfig {
            mailbox_capacity,
            ..self
        }
    }

    pub fn with_dist_denominator(self, dist_denominator: usize) -> Self {
        HdcpsConfig {
            dist_denominator,
            ..self
        }
    }

    pub fn with_overflow(self, overflow: OverflowPolicy) -> Self {
        HdcpsConfig { overflow, ..self }
    }

    pub fn with_drift(self, drift: DriftConfig) -> Self {
        HdcpsConfig { drift, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology.validate()?;
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroMailboxCapacity);
        }
        if self.dist_denominator == 0 {
            return Err(ConfigError::ZeroDenominator);
        }
        self.drift.validate(&self.topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let topology = Topology::new(4);
        assert_eq!(ObimConfig::new(topology).validate(), Ok(()));
        assert_eq!(ReldConfig::new(topology).validate(), Ok(()));
        assert_eq!(HdcpsConfig::new(topology).validate(), Ok(()));
        assert_eq!(
            MinnConfig::new(ObimConfig::new(topology), 1).validate(),
            Ok(())
        );
    }

    #[test]
    fn rejects_oversized_block_period() {
        let config = ObimConfig::new(Topology::new(1)).with_block_period(32);
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlockPeriodTooLarge { period: 32, max: 31 })
        );
    }

    #[test]
    fn rejects_bad_minnow_splits() {
        let obim = ObimConfig::new(Topology::new(4));
        for minnows in [0, 4, 5] {
            assert!(matches!(
                MinnConfig::new(obim, minnows).validate(),
                Err(ConfigError::MinnowSplit { .. })
            ));
        }
        assert_eq!(
            MinnConfig::new(obim.with_barrier(true), 1).validate(),
            Err(ConfigError::MinnBarrier)
        );
        assert_eq!(MinnConfig::new(obim, 1).producers(), 3);
    }

    #[test]
    fn rejects_inconsistent_drift_bounds() {
        let topology = Topology::new(2);
        let drift = DriftConfig::default().with_bounds(5, 4);
        assert!(matches!(
            drift.validate(&topology),
            Err(ConfigError::DriftBounds { .. })
        ));
        let drift = DriftConfig::default().with_coordinator(2);
        assert!(matches!(
            drift.validate(&topology),
            Err(ConfigError::CoordinatorOutOfRange { .. })
        ));
        assert_eq!(
            DriftConfig::default().with_sampling(10, 0).validate(&topology),
            Err(ConfigError::ZeroSampleWindow)
        );
    }

    #[test]
    fn rejects_empty_mailboxes() {
        let config = HdcpsConfig::new(Topology::new(2)).with_mailbox_capacity(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroMailboxCapacity));
        let config = HdcpsConfig::new(Topology::new(2)).with_dist_denominator(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroDenominator));
    }
}
