use thiserror::Error;

/// Reasons a worklist or thread pool configuration is rejected at
/// construction time.
///
/// Steady-state operations never return errors: a `pop` that finds nothing
/// returns `None`, and broken caller contracts panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("a topology needs at least one thread")]
    NoThreads,
    #[error("{threads} threads requested but at most {max} are supported")]
    TooManyThreads { threads: usize, max: usize },
    #[error("locality groups must contain at least one thread")]
    ZeroGroupSize,
    #[error("block period 2^{period} does not fit in the pop counter (max {max})")]
    BlockPeriodTooLarge { period: u32, max: u32 },
    #[error("{minnows} minnow workers cannot serve a pool of {threads} threads")]
    MinnowSplit { threads: usize, minnows: usize },
    #[error("barrier mode is not available when minnow workers own the bucket index")]
    MinnBarrier,
    #[error("mailbox capacity must be non-zero")]
    ZeroMailboxCapacity,
    #[error("distribution denominator must be non-zero")]
    ZeroDenominator,
    #[error("distribution factor bounds are inconsistent: floor {floor}, initial {initial}, ceiling {ceiling}")]
    DriftBounds {
        floor: usize,
        initial: usize,
        ceiling: usize,
    },
    #[error("drift sample window must be non-zero")]
    ZeroSampleWindow,
    #[error("drift coordinator {coordinator} is outside a pool of {threads} threads")]
    CoordinatorOutOfRange { coordinator: usize, threads: usize },
}
