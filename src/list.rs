//! Lock-light singly linked containers.
//!
//! Both containers hold boxed [`ListNode`]s behind a [`PtrLock`] head. Pushes
//! onto the stack are lock-free compare-and-swap loops; structural pops take
//! the head lock briefly. Either container can be checked for emptiness
//! without touching the lock, which is what keeps idle polling cheap.
//!
//! Nodes are owned by whichever container currently links them. A node is
//! only ever freed by the thread that unlinked it while holding the head lock,
//! so no thread can be left dereferencing a freed node.

use std::{
    fmt,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crossbeam_utils::Backoff;

use crate::ptr_lock::PtrLock;

// -----------------------------------------------------------------------------
// List node

/// A value with an embedded link to the next node.
pub struct ListNode<T> {
    next: *mut ListNode<T>,
    value: T,
}

impl<T> ListNode<T> {
    /// Allocates a new unlinked node.
    pub fn new(value: T) -> Box<ListNode<T>> {
        Box::new(ListNode {
            next: ptr::null_mut(),
            value,
        })
    }

    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Consumes the node and returns its value.
    #[inline]
    pub fn into_inner(self: Box<Self>) -> T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for ListNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListNode").field(&self.value).finish()
    }
}

// SAFETY: The `next` link is only followed by the container that owns the
// node, so a node is exactly as thread-safe as its value.
unsafe impl<T: Send> Send for ListNode<T> {}

/// Borrowing iterator over a container that is not being modified.
pub struct Iter<'a, T> {
    at: *const ListNode<T>,
    marker: std::marker::PhantomData<&'a ListNode<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        // SAFETY: The iterator borrows the container mutably, so no node can
        // be unlinked or freed while it is alive.
        let node = unsafe { self.at.as_ref()? };
        self.at = node.next;
        Some(&node.value)
    }
}

/// Frees every node of a chain starting at `head`.
///
/// # Safety
///
/// The chain must be exclusively owned by the caller.
unsafe fn free_chain<T>(mut head: *mut ListNode<T>) {
    while !head.is_null() {
        // SAFETY: Every linked node came from `Box::into_raw` and is owned by
        // the caller.
        let node = unsafe { Box::from_raw(head) };
        head = node.next;
    }
}

// -----------------------------------------------------------------------------
// Linked stack

/// A LIFO stack of nodes.
pub struct LinkedStack<T> {
    head: PtrLock<ListNode<T>>,
}

impl<T> LinkedStack<T> {
    pub const fn new() -> Self {
        LinkedStack {
            head: PtrLock::new(),
        }
    }

    /// Returns `true` if the stack has no nodes. Lock-free.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Links a node onto the top of the stack.
    pub fn push_node(&self, node: Box<ListNode<T>>) {
        let node = Box::into_raw(node);
        let backoff = Backoff::new();
        loop {
            let old_head = self.head.value();
            // SAFETY: The node is not yet visible to any other thread.
            unsafe { (*node).next = old_head };
            if self.head.compare_and_swap(old_head, node) {
                return;
            }
            backoff.spin();
        }
    }

    /// Unlinks the node on top of the stack.
    pub fn pop_node(&self) -> Option<Box<ListNode<T>>> {
        // Lock-free fast path for the empty case.
        if self.is_empty() {
            return None;
        }

        // Taking the lock disables concurrent pushes and pops.
        self.head.lock();
        let top = self.head.value();
        if top.is_null() {
            self.head.unlock();
            return None;
        }
        // SAFETY: We hold the lock, so no other thread can unlink or free the
        // top node, and the node came from `Box::into_raw`.
        let mut node = unsafe { Box::from_raw(top) };
        self.head.unlock_and_set(node.next);
        node.next = ptr::null_mut();
        Some(node)
    }

    pub fn push(&self, value: T) {
        self.push_node(ListNode::new(value));
    }

    pub fn pop(&self) -> Option<T> {
        self.pop_node().map(ListNode::into_inner)
    }

    /// Iterates from top to bottom. Requires exclusive access, since walking
    /// the links is not safe against concurrent pops.
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter {
            at: self.head.value(),
            marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for LinkedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LinkedStack<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the chain.
        unsafe { free_chain(self.head.value()) };
    }
}

// SAFETY: All access to linked nodes is serialized through the head lock.
unsafe impl<T: Send> Send for LinkedStack<T> {}
unsafe impl<T: Send> Sync for LinkedStack<T> {}

// -----------------------------------------------------------------------------
// Linked queue

/// A FIFO queue of nodes. Every structural change happens under the head
/// lock; only the emptiness check is lock-free.
pub struct LinkedQueue<T> {
    head: PtrLock<ListNode<T>>,
    /// Only written while the head lock is held.
    tail: AtomicPtr<ListNode<T>>,
}

impl<T> LinkedQueue<T> {
    pub const fn new() -> Self {
        LinkedQueue {
            head: PtrLock::new(),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns `true` if the queue has no nodes. Lock-free.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Links a node at the back of the queue.
    pub fn push_node(&self, node: Box<ListNode<T>>) {
        let node = Box::into_raw(node);
        // SAFETY: The node is not yet visible to any other thread.
        unsafe { (*node).next = ptr::null_mut() };

        self.head.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store(node, Ordering::Relaxed);
        if tail.is_null() {
            debug_assert!(self.head.is_null());
            self.head.unlock_and_set(node);
        } else {
            // SAFETY: We hold the lock and the tail is owned by the queue.
            unsafe { (*tail).next = node };
            self.head.unlock();
        }
    }

    /// Unlinks the node at the front of the queue.
    pub fn pop_node(&self) -> Option<Box<ListNode<T>>> {
        // Lock-free fast path for the empty case.
        if self.is_empty() {
            return None;
        }

        self.head.lock();
        let front = self.head.value();
        if front.is_null() {
            self.head.unlock();
            return None;
        }
        // SAFETY: We hold the lock, so the front node cannot be unlinked by
        // anyone else, and the node came from `Box::into_raw`.
        let mut node = unsafe { Box::from_raw(front) };
        if self.tail.load(Ordering::Relaxed) == front {
            debug_assert!(node.next.is_null());
            self.tail.store(ptr::null_mut(), Ordering::Relaxed);
            self.head.unlock_and_clear();
        } else {
            self.head.unlock_and_set(node.next);
            node.next = ptr::null_mut();
        }
        Some(node)
    }

    pub fn push(&self, value: T) {
        self.push_node(ListNode::new(value));
    }

    pub fn pop(&self) -> Option<T> {
        self.pop_node().map(ListNode::into_inner)
    }

    /// Iterates from front to back. Requires exclusive access.
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter {
            at: self.head.value(),
            marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the chain.
        unsafe { free_chain(self.head.value()) };
    }
}

// SAFETY: All access to linked nodes is serialized through the head lock.
unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send> Sync for LinkedQueue<T> {}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn stack_is_lifo() {
        let mut stack = LinkedStack::new();
        assert!(stack.is_empty());
        for i in 0..4 {
            stack.push(i);
        }
        assert_eq!(stack.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1, 0]);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        stack.push(9);
        assert_eq!(stack.pop(), Some(9));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(0));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn queue_is_fifo_and_resets_tail() {
        let mut queue = LinkedQueue::new();
        queue.push("a");
        assert_eq!(queue.pop(), Some("a"));
        assert!(queue.is_empty());

        // The tail must have been cleared, or this push would link onto a
        // freed node.
        queue.push("b");
        queue.push("c");
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn node_round_trip_keeps_value() {
        let stack = LinkedStack::new();
        let mut node = ListNode::new(5);
        *node.value_mut() += 1;
        stack.push_node(node);
        let node = stack.pop_node().unwrap();
        assert_eq!(*node.value(), 6);
        assert_eq!(node.into_inner(), 6);
    }

    struct DropCounter<'a>(&'a AtomicUsize);

    impl Drop for DropCounter<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dropping_containers_frees_remaining_nodes() {
        let drops = AtomicUsize::new(0);
        {
            let stack = LinkedStack::new();
            let queue = LinkedQueue::new();
            for _ in 0..3 {
                stack.push(DropCounter(&drops));
                queue.push(DropCounter(&drops));
            }
        }
        assert_eq!(drops.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn concurrent_push_pop_loses_nothing() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 2_000;

        let stack = LinkedStack::new();
        let queue = LinkedQueue::new();
        let popped: Vec<Vec<usize>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let (stack, queue) = (&stack, &queue);
                    s.spawn(move || {
                        let mut seen = Vec::new();
                        for i in 0..PER_THREAD {
                            stack.push(t * PER_THREAD + i);
                            queue.push(t * PER_THREAD + i);
                            seen.extend(stack.pop());
                            seen.extend(queue.pop());
                        }
                        seen
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut all: Vec<usize> = popped.into_iter().flatten().collect();
        all.extend(std::iter::from_fn(|| stack.pop()));
        all.extend(std::iter::from_fn(|| queue.pop()));
        assert_eq!(all.len(), 2 * THREADS * PER_THREAD);

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), THREADS * PER_THREAD);
    }
}
