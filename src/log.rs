//! The master log: a globally shared, append-only record of every bucket
//! ever created, in creation order.
//!
//! Entries live in a segmented arena. Segment `s` holds `FIRST_SEGMENT << s`
//! slots, and segments are never moved or freed until the log drops, so an
//! entry's address and its [`BucketId`] stay valid for the life of the log.
//! That lets readers replay entries without taking any lock: they only ever
//! look at ids below the published version, and every such slot was filled
//! before the version was bumped.

use std::{
    array,
    sync::{
        atomic::{AtomicUsize, Ordering},
        OnceLock,
    },
};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

/// The stable index of a bucket in the master log.
pub type BucketId = usize;

const FIRST_SEGMENT_BITS: u32 = 5;
const FIRST_SEGMENT: usize = 1 << FIRST_SEGMENT_BITS;
const SEGMENTS: usize = (usize::BITS - FIRST_SEGMENT_BITS) as usize;

/// A logged bucket together with the key it serves.
pub struct LogEntry<K, C> {
    pub key: K,
    pub bucket: C,
}

type Segment<K, C> = Box<[OnceLock<LogEntry<K, C>>]>;

pub struct MasterLog<K, C> {
    segments: [OnceLock<Segment<K, C>>; SEGMENTS],
    /// Number of published entries. Only bumped while `writer` is held.
    version: CachePadded<AtomicUsize>,
    writer: Mutex<()>,
}

/// Proof that the caller holds the master log's writer lock.
pub struct WriteGuard<'a> {
    _lock: MutexGuard<'a, ()>,
}

/// Maps an id to its (segment, offset) pair.
#[inline]
fn locate(id: BucketId) -> (usize, usize) {
    let biased = id + FIRST_SEGMENT;
    let bit = usize::BITS - 1 - biased.leading_zeros();
    let segment = (bit - FIRST_SEGMENT_BITS) as usize;
    (segment, biased - (1 << bit))
}

impl<K, C> MasterLog<K, C> {
    pub fn new() -> Self {
        MasterLog {
            segments: array::from_fn(|_| OnceLock::new()),
            version: CachePadded::new(AtomicUsize::new(0)),
            writer: Mutex::new(()),
        }
    }

    /// Returns the number of published entries.
    #[inline]
    pub fn version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the entry with the given id, if it has been published.
    #[inline]
    pub fn get(&self, id: BucketId) -> Option<&LogEntry<K, C>> {
        if id >= self.version() {
            return None;
        }
        let (segment, offset) = locate(id);
        self.segments[segment].get()?.get(offset)?.get()
    }

    /// Returns the bucket with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not handed out by this log.
    #[inline]
    pub fn bucket(&self, id: BucketId) -> &C {
        match self.get(id) {
            Some(entry) => &entry.bucket,
            None => panic!("bucket {id} is not in the master log"),
        }
    }

    /// Iterates over the entries published at or after `from`, paired with
    /// their ids. Entries appended while iterating may or may not be seen.
    pub fn replay(&self, from: usize) -> impl Iterator<Item = (BucketId, &LogEntry<K, C>)> + '_ {
        let to = self.version();
        (from..to).filter_map(move |id| self.get(id).map(|entry| (id, entry)))
    }

    /// Tries to become the single writer without blocking.
    #[inline]
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        self.writer.try_lock().map(|lock| WriteGuard { _lock: lock })
    }

    /// Appends a new entry and publishes it by bumping the version by one.
    pub fn append(&self, _guard: &WriteGuard<'_>, key: K, bucket: C) -> BucketId {
        let id = self.version.load(Ordering::Relaxed);
        let (segment, offset) = locate(id);
        let slots = self.segments[segment].get_or_init(|| {
            (0..FIRST_SEGMENT << segment)
                .map(|_| OnceLock::new())
                .collect()
        });
        if slots[offset].set(LogEntry { key, bucket }).is_err() {
            unreachable!("master log slot {id} written twice");
        }
        self.version.fetch_add(1, Ordering::Release);
        id
    }
}

impl<K, C> Default for MasterLog<K, C> {
    fn default() -> Self {
        Self::new()
    }
}
