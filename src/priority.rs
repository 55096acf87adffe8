//! Priority keys, their ordering direction, and the indexer that derives a
//! key from a work item.

use std::{
    cmp,
    fmt::Debug,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Priority keys

/// An integer priority key.
///
/// Keys need a total order plus a lossless round trip through a `u64`, so that
/// a thread's current key can be published through an atomic and read by its
/// peers without locking.
pub trait Priority: Copy + Ord + Debug + Send + Sync + 'static {
    const MIN: Self;
    const MAX: Self;

    fn to_bits(self) -> u64;

    fn from_bits(bits: u64) -> Self;

    /// Returns `|self - other|`, saturating at `u64::MAX`.
    fn distance(self, other: Self) -> u64;
}

macro_rules! impl_priority {
    ($($ty:ty => $wide:ty),* $(,)?) => {
        $(
            impl Priority for $ty {
                const MIN: Self = <$ty>::MIN;
                const MAX: Self = <$ty>::MAX;

                #[inline]
                fn to_bits(self) -> u64 {
                    self as $wide as u64
                }

                #[inline]
                fn from_bits(bits: u64) -> Self {
                    bits as $wide as $ty
                }

                #[inline]
                fn distance(self, other: Self) -> u64 {
                    let diff = (self as i128 - other as i128).unsigned_abs();
                    u64::try_from(diff).unwrap_or(u64::MAX)
                }
            }
        )*
    };
}

impl_priority! {
    i8 => i64, i16 => i64, i32 => i64, i64 => i64, isize => i64,
    u8 => u64, u16 => u64, u32 => u64, u64 => u64, usize => u64,
}

/// A priority key that can be stored and loaded atomically.
///
/// All accesses are `Relaxed`: the value is a scheduling hint and no other
/// memory is published through it.
pub struct AtomicPriority<K> {
    bits: AtomicU64,
    marker: PhantomData<K>,
}

impl<K: Priority> AtomicPriority<K> {
    pub fn new(value: K) -> Self {
        AtomicPriority {
            bits: AtomicU64::new(value.to_bits()),
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self) -> K {
        K::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: K) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl<K: Priority> Debug for AtomicPriority<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load().fmt(f)
    }
}

// -----------------------------------------------------------------------------
// Ordering direction

/// Which end of the key range is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    /// Smaller keys are more favorable.
    #[default]
    Ascending,
    /// Larger keys are more favorable.
    Descending,
}

impl Order {
    /// Returns `true` if `a` is strictly more favorable than `b`.
    #[inline]
    pub fn precedes<K: Ord>(self, a: K, b: K) -> bool {
        match self {
            Order::Ascending => a < b,
            Order::Descending => a > b,
        }
    }

    /// The sentinel no key can precede: `K::MIN` when ascending, `K::MAX`
    /// when descending.
    #[inline]
    pub fn identity<K: Priority>(self) -> K {
        match self {
            Order::Ascending => K::MIN,
            Order::Descending => K::MAX,
        }
    }

    /// Compares two keys so that the more favorable one is `Greater`, which
    /// is what a max-heap wants.
    #[inline]
    pub fn favor<K: Ord>(self, a: &K, b: &K) -> cmp::Ordering {
        match self {
            Order::Ascending => b.cmp(a),
            Order::Descending => a.cmp(b),
        }
    }
}

// -----------------------------------------------------------------------------
// Indexer

/// Derives the priority key of a work item.
///
/// Indexers must be pure and deterministic: they are called concurrently from
/// every thread, and the same item must always map to the same key.
pub trait Indexer<T, K>: Send + Sync {
    fn index(&self, item: &T) -> K;
}

impl<T, K, F> Indexer<T, K> for F
where
    F: Fn(&T) -> K + Send + Sync,
{
    #[inline]
    fn index(&self, item: &T) -> K {
        self(item)
    }
}

/// An item tagged with its key and ordered for a max-heap so that the most
/// favorable key under `order` sits on top.
pub(crate) struct Prioritized<K, T> {
    pub key: K,
    pub order: Order,
    pub item: T,
}

impl<K: Ord, T> PartialEq for Prioritized<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Ord, T> Eq for Prioritized<K, T> {}

impl<K: Ord, T> PartialOrd for Prioritized<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for Prioritized<K, T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.order.favor(&self.key, &other.key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    #[test]
    fn bits_round_trip_signed_extremes() {
        for value in [i32::MIN, -1, 0, 1, i32::MAX] {
            assert_eq!(i32::from_bits(value.to_bits()), value);
        }
        for value in [i64::MIN, i64::MAX] {
            assert_eq!(i64::from_bits(value.to_bits()), value);
        }
        assert_eq!(u64::from_bits(u64::MAX.to_bits()), u64::MAX);
    }

    #[test]
    fn distance_is_symmetric_and_saturates() {
        assert_eq!(3i32.distance(-4), 7);
        assert_eq!((-4i32).distance(3), 7);
        assert_eq!(i64::MIN.distance(i64::MAX), u64::MAX);
        assert_eq!(10u8.distance(250), 240);
    }

    #[test]
    fn order_identity_precedes_nothing() {
        assert!(!Order::Ascending.precedes(7i32, Order::Ascending.identity()));
        assert!(!Order::Descending.precedes(7i32, Order::Descending.identity()));
        assert!(Order::Ascending.precedes(1, 2));
        assert!(Order::Descending.precedes(2, 1));
        assert!(!Order::Ascending.precedes(2, 2));
    }

    #[test]
    fn heap_serves_most_favorable_first() {
        for (order, expected) in [
            (Order::Ascending, vec![1, 3, 9]),
            (Order::Descending, vec![9, 3, 1]),
        ] {
            let mut heap: BinaryHeap<_> = [3, 9, 1]
                .into_iter()
                .map(|key| Prioritized { key, order, item: () })
                .collect();
            let popped: Vec<i32> = std::iter::from_fn(|| heap.pop().map(|p| p.key)).collect();
            assert_eq!(popped, expected);
        }
    }

    #[test]
    fn atomic_priority_publishes_value() {
        let cell = AtomicPriority::new(-5i16);
        assert_eq!(cell.load(), -5);
        cell.store(12);
        assert_eq!(cell.load(), 12);
    }
}
