//! A lock-free recycler for expensive-to-build objects.
//!
//! Storage is an arena of bounded MPMC rings with doubling capacities.
//! `release` always pushes into the newest ring; `acquire` scans from
//! an atomic head index that advances past rings that can no longer
//! refill. When every ring is empty the user factory builds a fresh
//! instance, so the pool never blocks.
//!
//! The ring slots use per-slot sequence numbers (Vyukov's bounded MPMC
//! queue) so that producers and consumers only contend on their own
//! end of the ring.

use crate::sync::{Ordering, AtomicUsize, RwLock};

use crossbeam_utils::CachePadded;

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

pub struct ConcurrentPool<T> {
    head_ring: CachePadded<AtomicUsize>,
    rings: RwLock<Vec<Ring<T>>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

unsafe impl<T: Send> Send for ConcurrentPool<T> {}
unsafe impl<T: Send> Sync for ConcurrentPool<T> {}

impl<T> ConcurrentPool<T> {
    /// The initial ring capacity must be a power of two.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        assert!(
            capacity.is_power_of_two(),
            "pool capacity must be a power of two, got {}",
            capacity
        );

        ConcurrentPool {
            head_ring: CachePadded::new(AtomicUsize::new(0)),
            rings: RwLock::new(vec![Ring::new(capacity)]),
            factory: Box::new(factory),
        }
    }

    /// Takes a pooled instance, or builds one when the pool is empty.
    /// No two concurrently outstanding calls ever return the same
    /// pooled instance.
    pub fn acquire(&self) -> T {
        {
            let rings = self.rings.read().unwrap();
            let first = self.head_ring.load(Ordering::Relaxed).min(rings.len() - 1);
            for i in first..rings.len() {
                if let Some(value) = rings[i].pop() {
                    if i > first {
                        // The rings we skipped were empty and only the
                        // newest ring receives releases, so they can
                        // never refill. Don't scan them again.
                        self.head_ring.fetch_max(i, Ordering::Relaxed);
                    }
                    return value;
                }
            }
        }

        (self.factory)()
    }

    /// Returns an instance to the pool. Grows the arena with a ring
    /// twice the size of the newest one when it is full.
    pub fn release(&self, value: T) {
        let mut value = value;
        loop {
            {
                let rings = self.rings.read().unwrap();
                match rings.last().unwrap().push(value) {
                    Ok(()) => return,
                    Err(rejected) => value = rejected,
                }
            }

            let mut rings = self.rings.write().unwrap();
            // Someone else may have grown the arena while we waited for
            // the write lock.
            match rings.last().unwrap().push(value) {
                Ok(()) => return,
                Err(rejected) => {
                    let capacity = rings.last().unwrap().capacity() * 2;
                    rings.push(Ring::new(capacity));
                    value = rejected;
                }
            }
        }
    }
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Ring<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
    mask: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Ring {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
            mask: capacity - 1,
        }
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == pos {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if sequence < pos {
                // The slot a full lap behind hasn't been consumed: full.
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    fn pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == pos + 1 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if sequence <= pos {
                // Nothing has been pushed here yet: empty.
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for pos in head..tail {
            let slot = &self.slots[pos & self.mask];
            unsafe { (*slot.value.get()).assume_init_drop() };
        }
    }
}
