use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crossbeam_utils::Backoff;

/// A raw pointer with a spin lock folded into its lowest bit.
///
/// The lock does not own the pointee; it only serializes structural updates
/// to whatever structure the pointer heads. Unlocked compare-and-swap is
/// possible through [`PtrLock::compare_and_swap`], which fails whenever the
/// lock is held because the expected value never carries the tag.
pub struct PtrLock<T>(
    /// The lowest bit of the inner pointer is the lock flag. The remaining
    /// bits are the pointer value, which must be at least 2-aligned.
    AtomicPtr<T>,
);

const LOCKED: usize = 1;

impl<T> PtrLock<T> {
    /// Creates an unlocked null pointer.
    pub const fn new() -> Self {
        if const { std::mem::align_of::<T>() & LOCKED != 0 } {
            panic!("PtrLock may only be used on types with alignment of at least 2");
        }
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    #[inline]
    fn strip(tagged: *mut T) -> *mut T {
        (tagged as usize & !LOCKED) as *mut T
    }

    #[inline]
    fn tag(value: *mut T) -> *mut T {
        (value as usize | LOCKED) as *mut T
    }

    /// Returns the pointer value, ignoring the lock.
    #[inline]
    pub fn value(&self) -> *mut T {
        Self::strip(self.0.load(Ordering::Acquire))
    }

    /// Returns `true` if the pointer value is null. Reading the value does not
    /// need the lock, which makes this the cheap empty check.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value().is_null()
    }

    /// Returns `true` if some thread holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) as usize & LOCKED != 0
    }

    /// Tries to take the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let current = self.0.load(Ordering::Relaxed);
        current as usize & LOCKED == 0
            && self
                .0
                .compare_exchange(current, Self::tag(current), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Spins until the lock is taken.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            backoff.snooze();
        }
    }

    /// Releases the lock, keeping the pointer value.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.0.store(self.value(), Ordering::Release);
    }

    /// Releases the lock and replaces the pointer value in a single store.
    #[inline]
    pub fn unlock_and_set(&self, value: *mut T) {
        debug_assert!(self.is_locked());
        debug_assert_eq!(value as usize & LOCKED, 0);
        self.0.store(value, Ordering::Release);
    }

    /// Releases the lock and resets the pointer to null.
    #[inline]
    pub fn unlock_and_clear(&self) {
        self.unlock_and_set(ptr::null_mut());
    }

    /// Replaces `old` with `new` if the lock is free and the value is still
    /// `old`.
    #[inline]
    pub fn compare_and_swap(&self, old: *mut T, new: *mut T) -> bool {
        debug_assert_eq!(new as usize & LOCKED, 0);
        self.0
            .compare_exchange(Self::strip(old), new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T> Default for PtrLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_fails_while_locked() {
        let mut target = 7u64;
        let lock = PtrLock::<u64>::new();
        assert!(lock.is_null());

        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        assert!(!lock.compare_and_swap(ptr::null_mut(), &mut target));

        lock.unlock();
        assert!(lock.compare_and_swap(ptr::null_mut(), &mut target));
        assert_eq!(lock.value(), &mut target as *mut u64);
    }

    #[test]
    fn unlock_and_set_replaces_value() {
        let mut target = 1u32;
        let lock = PtrLock::<u32>::new();
        lock.lock();
        lock.unlock_and_set(&mut target);
        assert!(!lock.is_locked());
        assert_eq!(lock.value(), &mut target as *mut u32);

        lock.lock();
        lock.unlock_and_clear();
        assert!(lock.is_null());
    }
}
