use std::cell::Cell;

// -----------------------------------------------------------------------------
// Call on drop guard

// A guard that calls the specified closure when it is dropped. This is used
// to clear a thread's worker registration when a broadcast finishes or
// unwinds.
pub struct CallOnDrop<F: FnMut()>(pub F);

impl<F: FnMut()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

// -----------------------------------------------------------------------------
// Xorshift fast prng (taken from rayon)

/// [xorshift*] is a fast pseudorandom number generator which will
/// even tolerate weak seeding, as long as it's not zero.
///
/// Each worker owns one of these; it drives random placement in the `Reld`
/// worklist.
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
pub struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    /// Initializes the prng with a seed. Provided seed must be nonzero.
    pub fn new(seed: u64) -> Self {
        XorShift64Star {
            state: Cell::new(seed),
        }
    }

    /// Returns a pseudorandom number.
    pub fn next(&self) -> u64 {
        let mut x = self.state.get();
        debug_assert_ne!(x, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Return a pseudorandom number from `0..n`.
    pub fn next_usize(&self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_stays_in_range() {
        let rng = XorShift64Star::new(7);
        for _ in 0..1000 {
            assert!(rng.next_usize(5) < 5);
        }
    }

    #[test]
    fn call_on_drop_runs_once() {
        let hits = Cell::new(0);
        {
            let _guard = CallOnDrop(|| hits.set(hits.get() + 1));
        }
        assert_eq!(hits.get(), 1);
    }
}
