use crossbeam_queue::SegQueue;

use crate::list::{LinkedQueue, LinkedStack};

/// The container that holds every queued item of one priority key.
///
/// Buckets are shared by all threads and must handle concurrent `push` and
/// `pop` without outside locking. Each distinct key gets exactly one bucket,
/// created with `Default` the first time the key is seen.
pub trait Bucket<T>: Default + Send + Sync {
    fn push(&self, item: T);

    fn pop(&self) -> Option<T>;
}

/// An unbounded FIFO bucket backed by crossbeam's segmented lock-free queue.
/// This is the default bucket for every worklist.
pub struct SegFifo<T>(SegQueue<T>);

impl<T> Default for SegFifo<T> {
    fn default() -> Self {
        SegFifo(SegQueue::new())
    }
}

impl<T: Send> Bucket<T> for SegFifo<T> {
    #[inline]
    fn push(&self, item: T) {
        self.0.push(item);
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        self.0.pop()
    }
}

/// A LIFO bucket.
impl<T: Send> Bucket<T> for LinkedStack<T> {
    #[inline]
    fn push(&self, item: T) {
        LinkedStack::push(self, item);
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        LinkedStack::pop(self)
    }
}

/// A FIFO bucket that locks on every operation; cheaper than `SegFifo` when
/// buckets are mostly idle.
impl<T: Send> Bucket<T> for LinkedQueue<T> {
    #[inline]
    fn push(&self, item: T) {
        LinkedQueue::push(self, item);
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        LinkedQueue::pop(self)
    }
}
