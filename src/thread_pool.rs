use std::{cell::Cell, panic, ptr, thread};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    util::{CallOnDrop, XorShift64Star},
};

// -----------------------------------------------------------------------------
// Topology

/// This crate puts a hard upper-bound on the number of threads a worklist can
/// be sized for. Per-thread storage is allocated up front, one cache line per
/// thread, so this mostly guards against absurd configurations.
pub const MAX_THREADS: usize = 256;

/// The shape of a pool: how many threads it has and how they are grouped into
/// localities (sockets, CCDs, ...).
///
/// The first thread of every group is that group's leader. Leaders aggregate
/// pool-wide state on behalf of the rest of their group, so that the other
/// members only ever read one remote cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    threads: usize,
    group_size: usize,
}

impl Topology {
    /// A topology of `threads` threads forming a single locality group.
    pub const fn new(threads: usize) -> Topology {
        Topology {
            threads,
            group_size: if threads == 0 { 1 } else { threads },
        }
    }

    /// Splits the threads into locality groups of `group_size` consecutive
    /// indices.
    pub const fn with_group_size(self, group_size: usize) -> Topology {
        Topology { group_size, ..self }
    }

    /// Returns the number of threads in the pool.
    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Returns the number of threads in each locality group.
    #[inline]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Returns the index of the leader of the group containing `index`.
    #[inline]
    pub fn leader_of(&self, index: usize) -> usize {
        index - index % self.group_size
    }

    /// Returns `true` if `index` leads its locality group.
    #[inline]
    pub fn is_leader(&self, index: usize) -> bool {
        index % self.group_size == 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.threads > MAX_THREADS {
            return Err(ConfigError::TooManyThreads {
                threads: self.threads,
                max: MAX_THREADS,
            });
        }
        if self.group_size == 0 {
            return Err(ConfigError::ZeroGroupSize);
        }
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_THREADS);
        Topology::new(threads)
    }
}

// -----------------------------------------------------------------------------
// Thread pool

/// A fixed-size pool that runs the same closure on every one of its threads
/// at once, which is how the worklists in this crate expect to be driven.
///
/// The calling thread always takes slot 0; the remaining slots run on scoped
/// threads, so the closure may borrow from the caller's stack.
///
/// ```
/// # use obim::prelude::*;
/// let pool = ThreadPool::new(Topology::new(2)).unwrap();
/// let indices = pool.broadcast(|worker| worker.index());
/// assert_eq!(indices, vec![0, 1]);
/// ```
pub struct ThreadPool {
    topology: Topology,
}

impl ThreadPool {
    /// Creates a pool with the given topology.
    pub fn new(topology: Topology) -> Result<ThreadPool, ConfigError> {
        topology.validate()?;
        Ok(ThreadPool { topology })
    }

    /// Returns the shape of the pool.
    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Runs `f` once on every thread of the pool and returns the results
    /// ordered by thread index. Returns once every thread has finished.
    ///
    /// A panic on any thread is propagated to the caller after the others
    /// have been joined.
    pub fn broadcast<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(&WorkerThread) -> R + Sync,
        R: Send,
    {
        assert!(
            WorkerThread::current().is_null(),
            "broadcast cannot be nested inside a pool worker"
        );

        let topology = self.topology;
        thread::scope(|s| {
            let f = &f;
            let handles: Vec<_> = (1..topology.threads())
                .map(|index| {
                    thread::Builder::new()
                        .name(format!("obim-worker-{index}"))
                        .spawn_scoped(s, move || main_loop(topology, index, f))
                })
                .collect();

            let mut results = Vec::with_capacity(topology.threads());
            results.push(main_loop(topology, 0, f));

            for handle in handles {
                let joined = match handle {
                    Ok(handle) => handle.join(),
                    Err(err) => panic!("failed to spawn pool worker: {err}"),
                };
                match joined {
                    Ok(result) => results.push(result),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            results
        })
    }
}

/// Registers a worker for slot `index` on the current thread, then runs `f`.
fn main_loop<F, R>(topology: Topology, index: usize, f: &F) -> R
where
    F: Fn(&WorkerThread) -> R,
{
    let worker_thread = WorkerThread {
        index,
        topology,
        rng: XorShift64Star::new(index as u64 + 1),
    };

    // SAFETY: The guard is dropped before `worker_thread`, so the registered
    // pointer never outlives the worker.
    let _registration = unsafe { worker_thread.set_current() };

    f(&worker_thread)
}

// -----------------------------------------------------------------------------
// Worker threads

/// Data for a pool thread, stored in a thread-local for the duration of a
/// broadcast. Worklists use it to find their per-thread slot.
pub struct WorkerThread {
    index: usize,
    topology: Topology,
    rng: XorShift64Star,
}

thread_local! {
    static WORKER_THREAD_STATE: Cell<*const WorkerThread> = const { Cell::new(ptr::null()) };
}

impl WorkerThread {
    /// Sets `self` as the worker for the current thread, returning a guard
    /// that clears the registration again.
    ///
    /// # Safety
    ///
    /// The returned guard must be dropped before `self` is moved or dropped.
    unsafe fn set_current(&self) -> CallOnDrop<impl FnMut()> {
        WORKER_THREAD_STATE.with(|t| {
            assert!(t.get().is_null());
            t.set(self);
        });
        CallOnDrop(|| WORKER_THREAD_STATE.with(|t| t.set(ptr::null())))
    }

    /// Gets the `WorkerThread` for the current thread; returns NULL if this is
    /// not a worker thread.
    #[inline]
    pub fn current() -> *const WorkerThread {
        WORKER_THREAD_STATE.with(Cell::get)
    }

    /// Calls `f` with the worker registered on this thread, if any.
    #[inline]
    pub fn with_current<F, R>(f: F) -> R
    where
        F: FnOnce(Option<&WorkerThread>) -> R,
    {
        let worker = WorkerThread::current();
        // SAFETY: The pointer is either null or was registered by `main_loop`,
        // which keeps the worker alive until after it unregisters it. The
        // reference does not escape `f`.
        f(unsafe { worker.as_ref() })
    }

    /// Returns the unique index of the thread within the pool.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the shape of the pool this worker belongs to.
    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Returns `true` if this worker leads its locality group.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.topology.is_leader(self.index)
    }

    /// Returns the index of this worker's locality group leader.
    #[inline]
    pub fn leader(&self) -> usize {
        self.topology.leader_of(self.index)
    }

    /// Returns this worker's private random number generator.
    #[inline]
    pub(crate) fn rng(&self) -> &XorShift64Star {
        &self.rng
    }
}

/// Returns the pool index of the calling thread.
///
/// # Panics
///
/// Panics when called outside of [`ThreadPool::broadcast`]. Every worklist
/// operation is tied to a pool slot, so this is a caller contract breach.
#[inline]
pub fn current_index() -> usize {
    WorkerThread::with_current(|worker| match worker {
        Some(worker) => worker.index(),
        None => panic!("worklist used outside of a pool worker thread"),
    })
}

// -----------------------------------------------------------------------------
// Per-thread storage

/// One cache-padded slot per pool thread. Slots live as long as the storage
/// and may be read by any thread; each slot's interior mutability decides who
/// may write it.
pub struct PerThreadStorage<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerThreadStorage<T> {
    /// Allocates `threads` slots, initializing slot `i` with `init(i)`.
    pub fn new<F>(threads: usize, mut init: F) -> PerThreadStorage<T>
    where
        F: FnMut(usize) -> T,
    {
        PerThreadStorage {
            slots: (0..threads).map(|i| CachePadded::new(init(i))).collect(),
        }
    }

    /// Returns the number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the index of the calling thread's slot.
    ///
    /// # Panics
    ///
    /// Panics if the caller is not a pool worker, or if its index has no slot.
    #[inline]
    pub fn local_index(&self) -> usize {
        let index = current_index();
        assert!(
            index < self.slots.len(),
            "thread {index} has no slot in storage sized for {} threads",
            self.slots.len()
        );
        index
    }

    /// Returns the calling thread's slot.
    #[inline]
    pub fn local(&self) -> &T {
        &self.slots[self.local_index()]
    }

    /// Returns the slot of an arbitrary thread.
    #[inline]
    pub fn remote(&self, index: usize) -> &T {
        &self.slots[index]
    }

    /// Iterates over every slot in thread index order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().map(|slot| &**slot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn topology_groups_and_leaders() {
        let topology = Topology::new(8).with_group_size(4);
        assert_eq!(topology.leader_of(0), 0);
        assert_eq!(topology.leader_of(3), 0);
        assert_eq!(topology.leader_of(5), 4);
        assert!(topology.is_leader(4));
        assert!(!topology.is_leader(6));
    }

    #[test]
    fn topology_rejects_bad_shapes() {
        assert_eq!(Topology::new(0).validate(), Err(ConfigError::NoThreads));
        assert_eq!(
            Topology::new(4).with_group_size(0).validate(),
            Err(ConfigError::ZeroGroupSize)
        );
        assert!(matches!(
            Topology::new(MAX_THREADS + 1).validate(),
            Err(ConfigError::TooManyThreads { .. })
        ));
    }

    #[test]
    fn broadcast_runs_every_slot_once() {
        let pool = ThreadPool::new(Topology::new(4)).unwrap();
        let hits = AtomicUsize::new(0);
        let indices = pool.broadcast(|worker| {
            hits.fetch_add(1, Ordering::Relaxed);
            assert_eq!(current_index(), worker.index());
            worker.index()
        });
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(hits.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn registration_is_cleared_after_broadcast() {
        let pool = ThreadPool::new(Topology::new(1)).unwrap();
        pool.broadcast(|_| assert!(!WorkerThread::current().is_null()));
        assert!(WorkerThread::current().is_null());
    }

    #[test]
    #[should_panic(expected = "outside of a pool worker")]
    fn current_index_outside_pool_panics() {
        current_index();
    }

    #[test]
    fn per_thread_storage_local_and_remote() {
        let pool = ThreadPool::new(Topology::new(3)).unwrap();
        let storage = PerThreadStorage::new(3, |i| AtomicUsize::new(i * 10));
        pool.broadcast(|worker| {
            storage.local().fetch_add(1, Ordering::Relaxed);
            assert_eq!(storage.local_index(), worker.index());
        });
        let values: Vec<_> = storage.iter().map(|v| v.load(Ordering::Relaxed)).collect();
        assert_eq!(values, vec![1, 11, 21]);
        assert_eq!(storage.remote(2).load(Ordering::Relaxed), 21);
    }
}
