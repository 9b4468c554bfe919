//! An append-only vector that many threads can push into at once.
//!
//! A push reserves a globally unique index with one fetch-add, then
//! writes into the segment that owns the index. Segments are only ever
//! added (doubling the total capacity), never moved or freed while the
//! collector is open, so a writer never races with a reallocation.
//! Reading the items back requires `close`, which consolidates the
//! segments into one contiguous buffer; this is a deliberate two-phase
//! contract rather than a locking read path.

use crate::sync::{Ordering, AtomicUsize, RwLock};

use crossbeam_utils::CachePadded;

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::{Index, IndexMut};

const DEFAULT_CAPACITY: usize = 32;

struct Segment<T> {
    offset: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Segment<T> {
    fn new(offset: usize, len: usize) -> Self {
        Segment {
            offset,
            slots: (0..len).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
        }
    }
}

pub struct ConcurrentCollector<T> {
    len: CachePadded<AtomicUsize>,
    capacity: AtomicUsize,
    segments: RwLock<Vec<Segment<T>>>,
    /// Consolidated items, only populated once closed.
    items: Vec<T>,
    closed: bool,
}

unsafe impl<T: Send> Send for ConcurrentCollector<T> {}
unsafe impl<T: Send> Sync for ConcurrentCollector<T> {}

impl<T> ConcurrentCollector<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The initial capacity must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "collector capacity must be a power of two, got {}",
            capacity
        );

        ConcurrentCollector {
            len: CachePadded::new(AtomicUsize::new(0)),
            capacity: AtomicUsize::new(capacity),
            segments: RwLock::new(vec![Segment::new(0, capacity)]),
            items: Vec::new(),
            closed: false,
        }
    }

    /// Appends an item and returns its index. Can be called from any
    /// number of threads at once; indices are unique and dense.
    pub fn push(&self, value: T) -> usize {
        debug_assert!(!self.closed, "push on a closed collector");

        let index = self.len.fetch_add(1, Ordering::Relaxed);
        let mut value = value;
        loop {
            {
                let segments = self.segments.read().unwrap();
                if index < self.capacity.load(Ordering::Acquire) {
                    // Segment offsets grow with position, scan from the
                    // back; there are only ever a handful of segments.
                    for segment in segments.iter().rev() {
                        if index >= segment.offset {
                            unsafe {
                                (*segment.slots[index - segment.offset].get()).write(value);
                            }
                            return index;
                        }
                    }
                    unreachable!("no segment owns index {}", index);
                }
            }

            value = self.grow_for(index, value);
        }
    }

    /// Takes the write lock and adds segments until `index` fits.
    /// Returns the value untouched so the push loop can retry.
    fn grow_for(&self, index: usize, value: T) -> T {
        let mut segments = self.segments.write().unwrap();
        let mut capacity = self.capacity.load(Ordering::Acquire);
        while index >= capacity {
            segments.push(Segment::new(capacity, capacity));
            capacity *= 2;
            self.capacity.store(capacity, Ordering::Release);
        }
        value
    }

    /// Number of items pushed so far (or collected, once closed).
    pub fn len(&self) -> usize {
        if self.closed {
            self.items.len()
        } else {
            self.len.load(Ordering::Relaxed)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consolidates everything pushed so far into a contiguous buffer.
    /// Requiring `&mut self` guarantees no push is in flight.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        let count = *self.len.get_mut();
        let segments = self.segments.get_mut().unwrap();

        self.items.reserve(count);
        for segment in segments.iter() {
            let filled = count
                .saturating_sub(segment.offset)
                .min(segment.slots.len());
            for slot in &segment.slots[..filled] {
                self.items.push(unsafe { (*slot.get()).assume_init_read() });
            }
        }

        // The slots' contents moved into `items`; forget them.
        *self.len.get_mut() = 0;
        self.closed = true;
    }

    /// Drops everything and reopens the collector for pushing, keeping
    /// the allocated segments around.
    pub fn clear(&mut self) {
        if !self.closed {
            self.drop_pending();
        }
        self.items.clear();
        *self.len.get_mut() = 0;
        self.closed = false;
    }

    pub fn as_slice(&self) -> &[T] {
        assert!(self.closed, "the collector must be closed before reading");
        &self.items
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        assert!(self.closed, "the collector must be closed before reading");
        &mut self.items
    }

    fn drop_pending(&mut self) {
        let count = *self.len.get_mut();
        let segments = self.segments.get_mut().unwrap();
        for segment in segments.iter_mut() {
            let filled = count
                .saturating_sub(segment.offset)
                .min(segment.slots.len());
            for slot in &mut segment.slots[..filled] {
                unsafe { (*slot.get()).assume_init_drop() };
            }
        }
        *self.len.get_mut() = 0;
    }
}

impl<T> Index<usize> for ConcurrentCollector<T> {
    type Output = T;
    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T> IndexMut<usize> for ConcurrentCollector<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<T> Drop for ConcurrentCollector<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.drop_pending();
        }
    }
}

impl<T> Default for ConcurrentCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    #[should_panic]
    fn capacity_must_be_power_of_two() {
        let _ = ConcurrentCollector::<u32>::with_capacity(12);
    }

    #[test]
    #[should_panic]
    fn read_before_close_panics() {
        let collector = ConcurrentCollector::<u32>::new();
        collector.push(1);
        let _ = collector.as_slice();
    }

    #[test]
    fn push_close_read() {
        let mut collector = ConcurrentCollector::with_capacity(4);
        for i in 0..100u32 {
            collector.push(i);
        }
        assert_eq!(collector.len(), 100);

        collector.close();
        assert_eq!(collector.len(), 100);

        let mut values: Vec<u32> = collector.as_slice().to_vec();
        values.sort_unstable();
        let expected: Vec<u32> = (0..100).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn concurrent_pushes_lose_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 10_000;

        let collector = Arc::new(ConcurrentCollector::with_capacity(16));
        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        collector.push((t * PER_THREAD + i) as u64);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut collector = Arc::try_unwrap(collector).map_err(|_| ()).unwrap();
        collector.close();
        assert_eq!(collector.len(), THREADS * PER_THREAD);

        let mut values = collector.as_slice().to_vec();
        values.sort_unstable();
        for (i, value) in values.iter().enumerate() {
            assert_eq!(*value, i as u64, "lost or duplicated item");
        }
    }

    #[test]
    fn clear_reopens() {
        let mut collector = ConcurrentCollector::with_capacity(4);
        for i in 0..10u32 {
            collector.push(i);
        }
        collector.close();
        assert_eq!(collector.len(), 10);

        collector.clear();
        assert_eq!(collector.len(), 0);
        collector.push(42);
        collector.close();
        assert_eq!(collector.as_slice(), &[42]);
    }

    #[test]
    fn drops_unclosed_items() {
        use std::sync::atomic::{AtomicUsize as Counter, Ordering as O};
        static DROPPED: Counter = Counter::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, O::SeqCst);
            }
        }

        {
            let collector = ConcurrentCollector::with_capacity(4);
            for _ in 0..10 {
                collector.push(Tracked);
            }
        }
        assert_eq!(DROPPED.load(O::SeqCst), 10);
    }
}
