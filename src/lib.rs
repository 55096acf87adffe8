//! Concurrent approximate priority worklists for parallel graph and task
//! processing.
//!
//! A worklist hands out work items roughly in order of an integer priority
//! key derived from each item. Strict priority order would need a global
//! structure every thread contends on; these worklists trade a bounded amount
//! of order for scalability.
//!
//! - [`OrderedByIntegerMetric`] keeps one shared bucket per key, discovered
//!   through an append-only master log. Threads drain the best bucket they
//!   know about and rescan according to a configurable scan policy.
//! - [`OrderedByIntegerMetricMinn`] dedicates some threads to maintaining the
//!   bucket index on behalf of the others.
//! - [`Reld`] and [`Hdcps`] give every thread a private priority queue and
//!   differ in where pushes go. `Hdcps` tunes its placement from the measured
//!   priority drift between threads.
//! - [`SharedQueue`] is a plain locked deque, kept as a baseline.
//!
//! Worklists are used from inside [`ThreadPool::broadcast`], which runs one
//! closure on every slot of a fixed-size pool. Each worklist identifies the
//! calling thread by its pool slot.
//!
//! [`OrderedByIntegerMetric`]: obim::OrderedByIntegerMetric
//! [`OrderedByIntegerMetricMinn`]: minn::OrderedByIntegerMetricMinn
//! [`Reld`]: reld::Reld
//! [`Hdcps`]: hdcps::Hdcps
//! [`SharedQueue`]: shared::SharedQueue
//! [`ThreadPool::broadcast`]: thread_pool::ThreadPool::broadcast

pub mod bucket;
pub mod config;
pub mod drift;
pub mod error;
pub mod hdcps;
pub mod index;
pub mod latch;
pub mod list;
pub mod log;
pub mod minn;
pub mod obim;
pub mod priority;
pub mod ptr_lock;
pub mod reld;
pub mod shared;
pub mod thread_pool;
pub mod worklist;

mod util;

pub mod prelude {
    pub use crate::{
        bucket::{Bucket, SegFifo},
        config::{DriftConfig, HdcpsConfig, MinnConfig, ObimConfig, OverflowPolicy, ReldConfig},
        error::ConfigError,
        hdcps::Hdcps,
        list::{LinkedQueue, LinkedStack},
        minn::OrderedByIntegerMetricMinn,
        obim::OrderedByIntegerMetric,
        priority::{Indexer, Order, Priority},
        reld::Reld,
        shared::{PopEnd, SharedQueue},
        thread_pool::{ThreadPool, Topology, WorkerThread},
        worklist::Worklist,
    };
}
