use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{thread_pool::current_index, worklist::Worklist};

/// Which end of a [`SharedQueue`] `pop` takes from. Pushes always go to the
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PopEnd {
    /// Last in, first out.
    #[default]
    Back,
    /// First in, first out.
    Front,
}

/// A single deque behind a mutex, ignoring priorities entirely.
///
/// It does not scale; it exists as a baseline to compare the priority
/// worklists against.
pub struct SharedQueue<T> {
    queue: Mutex<VecDeque<T>>,
    pop_end: PopEnd,
}

impl<T: Send> SharedQueue<T> {
    pub fn new(pop_end: PopEnd) -> Self {
        SharedQueue {
            queue: Mutex::new(VecDeque::new()),
            pop_end,
        }
    }

    pub fn lifo() -> Self {
        Self::new(PopEnd::Back)
    }

    pub fn fifo() -> Self {
        Self::new(PopEnd::Front)
    }

    #[inline]
    pub fn pop_end(&self) -> PopEnd {
        self.pop_end
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
    }

    pub fn push_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.queue.lock().extend(items);
    }

    /// Seeds the queue. Only the items given on thread 0 are used.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a pool worker thread.
    pub fn push_initial<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        if current_index() == 0 {
            self.push_all(items);
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        match self.pop_end {
            PopEnd::Back => queue.pop_back(),
            PopEnd::Front => queue.pop_front(),
        }
    }
}

impl<T: Send> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new(PopEnd::default())
    }
}

impl<T: Send> Worklist<T> for SharedQueue<T> {
    fn push(&self, item: T) {
        SharedQueue::push(self, item);
    }

    fn pop(&self) -> Option<T> {
        SharedQueue::pop(self)
    }

    fn push_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
        Self: Sized,
    {
        SharedQueue::push_all(self, items);
    }

    fn push_initial<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
        Self: Sized,
    {
        SharedQueue::push_initial(self, items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_pool::{ThreadPool, Topology};

    #[test]
    fn pop_end_decides_discipline() {
        let lifo = SharedQueue::lifo();
        let fifo = SharedQueue::fifo();
        for queue in [&lifo, &fifo] {
            queue.push_all([1, 2, 3]);
        }
        assert_eq!(std::iter::from_fn(|| lifo.pop()).collect::<Vec<_>>(), [3, 2, 1]);
        assert_eq!(std::iter::from_fn(|| fifo.pop()).collect::<Vec<_>>(), [1, 2, 3]);
        assert!(lifo.is_empty());
    }

    #[test]
    fn push_initial_only_seeds_from_thread_zero() {
        let pool = ThreadPool::new(Topology::new(3)).unwrap();
        let queue = SharedQueue::fifo();
        pool.broadcast(|worker| {
            let start = worker.index() * 10;
            queue.push_initial(start..start + 10);
        });
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.pop(), Some(0));
    }
}
