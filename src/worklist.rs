/// The interface shared by every worklist in this crate.
///
/// All methods must be called from inside [`ThreadPool::broadcast`]: a
/// worklist identifies its caller by the pool slot it runs on.
///
/// [`ThreadPool::broadcast`]: crate::thread_pool::ThreadPool::broadcast
pub trait Worklist<T>: Send + Sync {
    fn push(&self, item: T);

    /// Removes an item. `None` means no work is currently visible to the
    /// caller, not that the worklist is globally empty.
    fn pop(&self) -> Option<T>;

    fn push_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
        Self: Sized,
    {
        for item in items {
            self.push(item);
        }
    }

    /// Seeds the worklist before processing starts. Every thread calls this
    /// with its share of the initial items. Some worklists only accept the
    /// seed from thread 0 and ignore the rest; their docs say so.
    fn push_initial<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
        Self: Sized,
    {
        self.push_all(items);
    }
}
