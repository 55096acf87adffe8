//! Small blocking and polling primitives shared by the worklists.
//!
//! A latch begins "closed". Once it is "opened" by [`AtomicLatch::set`],
//! [`AtomicLatch::probe`] returns `true` until the latch is reset. The minnow
//! workers poll a latch to learn that the worklist is shutting down.
//!
//! A [`Barrier`] is a reusable rendezvous: it stays closed until a fixed
//! number of participants have arrived, then releases all of them at once and
//! closes again for the next round. The barrier-synchronized priority probe
//! (`OrderedByIntegerMetric::empty`) waits on one twice per round.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------
// Atomic latch

/// A simple latch implemented using an atomic bool.
pub struct AtomicLatch {
    /// The state of the latch, `true` for open and `false` for closed.
    state: AtomicBool,
}

impl AtomicLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }

    /// Opens the latch.
    #[inline]
    pub fn set(&self) {
        self.state.store(true, Ordering::Release);
    }

    /// Returns `true` if the latch is open, and `false` if it is closed.
    #[inline]
    pub fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }

    /// Resets the latch back to closed.
    #[inline]
    pub fn reset(&self) {
        self.state.store(false, Ordering::Release);
    }
}

impl Default for AtomicLatch {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Barrier

/// A reusable barrier for a fixed number of participants.
pub struct Barrier {
    participants: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

struct BarrierState {
    /// Number of threads waiting in the current round.
    arrived: usize,
    /// Bumped every time a round completes. Waiters sleep until it changes,
    /// which makes the barrier immune to spurious wakeups and safe to reuse
    /// immediately.
    generation: u64,
}

impl Barrier {
    /// Creates a barrier that opens once `participants` threads are waiting.
    pub fn new(participants: usize) -> Barrier {
        assert!(participants > 0, "a barrier needs at least one participant");
        Barrier {
            participants,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Returns the number of threads that must arrive before the barrier
    /// opens.
    #[inline]
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Blocks until every participant has called `wait` for this round.
    ///
    /// Exactly one caller per round (the last to arrive) gets `true`.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.released.notify_all();
            return true;
        }
        while state.generation == generation {
            self.released.wait(&mut state);
        }
        false
    }
}
