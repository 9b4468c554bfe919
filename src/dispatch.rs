//! Fork-join data parallel loops on top of the thread pool.
//!
//! A parallel loop splits its index range into at most
//! `max_parallelism` contiguous batches. The calling thread queues
//! `batches - 1` type-erased helper items pointing at a job living in
//! its own stack frame, then processes batches itself; helpers and
//! caller claim batches from a shared cursor. The caller only returns
//! once every helper reference has been released, executing other
//! pending work while it waits instead of spinning.
//!
//! Panics inside user actions are captured per index: one bad element
//! neither tears down a worker nor prevents the remaining elements
//! from running. The first captured panic resumes on the calling
//! thread after the whole operation has drained.

use crate::core;
use crate::core::job::{ForkJob, ForkRef};
use crate::core::thread_pool::ThreadPool;
use crate::sync::{Ordering, AtomicUsize, AtomicIsize};
use crate::util::{ExclusiveCheck, PanicSlot};

use crossbeam_utils::{Backoff, CachePadded};

use std::ops::Range;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// A handle for running data-parallel loops and sorts on a thread pool.
///
/// Cloning is cheap; per-handle the only state is the parallelism cap.
#[derive(Clone)]
pub struct Dispatcher {
    pool: ThreadPool,
    max_parallelism: usize,
}

impl Dispatcher {
    /// A dispatcher over `pool` with parallelism capped at the
    /// processor count.
    pub fn new(pool: &ThreadPool) -> Self {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Dispatcher {
            pool: pool.clone(),
            max_parallelism: processors,
        }
    }

    /// Caps the number of threads (caller included) a single operation
    /// runs on. A cap of 1 makes every operation sequential.
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        assert!(max_parallelism >= 1, "parallelism cap must be at least 1");
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Runs `f` exactly once for every index in `range`.
    pub fn for_range<F>(&self, range: Range<usize>, f: F)
    where
        F: Fn(usize) + Sync,
    {
        assert!(
            range.start <= range.end,
            "descending range {}..{}",
            range.start,
            range.end
        );
        let count = range.end - range.start;
        if self.max_parallelism <= 1 || count <= 1 {
            for index in range {
                f(index);
            }
            return;
        }

        let base = range.start;
        self.fork_join(count, &|start, end, panic: &PanicSlot| {
            for offset in start..end {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(base + offset))) {
                    panic.store(payload);
                }
            }
        });
    }

    /// Like `for_range` with a per-batch local value: `init` builds it
    /// when a thread takes its first index of a batch, `f` sees it for
    /// every index, and `finish` consumes it when the batch is done.
    pub fn for_range_local<L, I, F, D>(&self, range: Range<usize>, init: I, f: F, finish: D)
    where
        I: Fn() -> L + Sync,
        F: Fn(usize, &mut L) + Sync,
        D: Fn(L) + Sync,
    {
        assert!(
            range.start <= range.end,
            "descending range {}..{}",
            range.start,
            range.end
        );
        let count = range.end - range.start;
        if self.max_parallelism <= 1 || count <= 1 {
            if count > 0 {
                let mut local = init();
                for index in range {
                    f(index, &mut local);
                }
                finish(local);
            }
            return;
        }

        let base = range.start;
        self.fork_join(count, &|start, end, panic: &PanicSlot| {
            match catch_unwind(AssertUnwindSafe(&init)) {
                Ok(mut local) => {
                    for offset in start..end {
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| f(base + offset, &mut local)))
                        {
                            panic.store(payload);
                        }
                    }
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| finish(local))) {
                        panic.store(payload);
                    }
                }
                Err(payload) => panic.store(payload),
            }
        });
    }

    /// Runs `f` exactly once over every element of the slice.
    pub fn for_each<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(&mut T) + Sync,
    {
        let count = items.len();
        if self.max_parallelism <= 1 || count <= 1 {
            for item in items {
                f(item);
            }
            return;
        }

        let base = SendPtr(items.as_mut_ptr());
        self.fork_join(count, &|start, end, panic: &PanicSlot| {
            for offset in start..end {
                // Each index is claimed exactly once, so the mutable
                // references are disjoint.
                let item = unsafe { &mut *base.get().add(offset) };
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(item))) {
                    panic.store(payload);
                }
            }
        });
    }

    /// `for_each` with a per-batch local value, see `for_range_local`.
    pub fn for_each_local<T, L, I, F, D>(&self, items: &mut [T], init: I, f: F, finish: D)
    where
        T: Send,
        I: Fn() -> L + Sync,
        F: Fn(&mut T, &mut L) + Sync,
        D: Fn(L) + Sync,
    {
        let count = items.len();
        if self.max_parallelism <= 1 || count <= 1 {
            if count > 0 {
                let mut local = init();
                for item in items {
                    f(item, &mut local);
                }
                finish(local);
            }
            return;
        }

        let base = SendPtr(items.as_mut_ptr());
        self.fork_join(count, &|start, end, panic: &PanicSlot| {
            match catch_unwind(AssertUnwindSafe(&init)) {
                Ok(mut local) => {
                    for offset in start..end {
                        let item = unsafe { &mut *base.get().add(offset) };
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| f(item, &mut local)))
                        {
                            panic.store(payload);
                        }
                    }
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| finish(local))) {
                        panic.store(payload);
                    }
                }
                Err(payload) => panic.store(payload),
            }
        });
    }

    /// Splits `count` items into batches, forks helpers and joins them.
    /// `process` receives a half-open sub-range and must not unwind
    /// (user panics are captured inside it).
    fn fork_join<P>(&self, count: usize, process: &P)
    where
        P: Fn(usize, usize, &PanicSlot) + Sync,
    {
        profiling::scope!("fork_join");

        debug_assert!(count > 1 && self.max_parallelism > 1);
        let shared = &self.pool.shared;
        let batches = self.max_parallelism.min(count);
        let batch_size = (count + batches - 1) / batches;

        let coord = shared.batch_coords.acquire();
        coord.reset(batches as isize - 1);

        let job = BatchJob {
            coord: &coord,
            total: count,
            batch_size,
            process,
        };

        unsafe {
            core::queue_replicated(shared, ForkRef::new(&job), batches - 1);
        }

        // The caller is one of the forks.
        job.process_batches();

        // Wait for the helper copies to be released, making ourselves
        // useful in the meantime.
        let backoff = Backoff::new();
        while coord.refs.load(Ordering::Acquire) > 0 {
            if shared.try_cooperate() {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        debug_assert_eq!(coord.done.load(Ordering::Relaxed), count);

        coord.finish();
        let panic = coord.take_panic();
        shared.batch_coords.release(coord);

        if let Some(payload) = panic {
            resume_unwind(payload);
        }
    }
}

struct SendPtr<T>(*mut T);

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    /// Accessed through a method so that closures capture the `Sync`
    /// wrapper rather than the raw pointer field.
    fn get(&self) -> *mut T {
        self.0
    }
}

/// Shared coordination state of one fork-join operation, recycled
/// through the pool's `ConcurrentPool`.
pub(crate) struct BatchCoord {
    /// Next batch start index, claimed by fetch-add.
    cursor: CachePadded<AtomicUsize>,
    /// Items fully processed, reaches the total when the operation is
    /// semantically complete.
    done: CachePadded<AtomicUsize>,
    /// Outstanding helper copies; the forking thread blocks on this
    /// before releasing the stack frame the helpers point into.
    refs: CachePadded<AtomicIsize>,
    panic: PanicSlot,
    check: ExclusiveCheck<()>,
}

impl BatchCoord {
    pub fn new() -> Self {
        BatchCoord {
            cursor: CachePadded::new(AtomicUsize::new(0)),
            done: CachePadded::new(AtomicUsize::new(0)),
            refs: CachePadded::new(AtomicIsize::new(0)),
            panic: PanicSlot::new(),
            check: ExclusiveCheck::with_tag(()),
        }
    }

    fn reset(&self, helper_refs: isize) {
        self.check.begin();
        debug_assert!(!self.panic.has_panic());
        self.cursor.store(0, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.refs.store(helper_refs, Ordering::Release);
    }

    fn finish(&self) {
        self.check.end();
    }

    fn take_panic(&self) -> Option<Box<dyn std::any::Any + Send>> {
        self.panic.take()
    }
}

struct BatchJob<'a, P> {
    coord: &'a BatchCoord,
    total: usize,
    batch_size: usize,
    process: &'a P,
}

impl<P> BatchJob<'_, P>
where
    P: Fn(usize, usize, &PanicSlot) + Sync,
{
    fn process_batches(&self) {
        loop {
            let start = self.coord.cursor.fetch_add(self.batch_size, Ordering::Relaxed);
            if start >= self.total {
                break;
            }
            let end = (start + self.batch_size).min(self.total);
            (self.process)(start, end, &self.coord.panic);
            self.coord.done.fetch_add(end - start, Ordering::AcqRel);
        }
    }
}

impl<P> ForkJob for BatchJob<'_, P>
where
    P: Fn(usize, usize, &PanicSlot) + Sync,
{
    unsafe fn execute(this: *const Self) {
        let this = &*this;
        this.process_batches();
        // After this store the forking thread may return and free the
        // job, nothing may touch `this` anymore.
        this.coord.refs.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize as Counter, Ordering as O};
    use std::sync::Arc as StdArc;

    fn test_pool() -> ThreadPool {
        ThreadPool::builder().with_thread_count(1, 4).build()
    }

    #[test]
    fn for_range_runs_every_index_once() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(4);

        for count in [0usize, 1, 2, 1000, 100_000] {
            let hits: Vec<AtomicU8> = (0..count).map(|_| AtomicU8::new(0)).collect();
            dispatcher.for_range(0..count, |i| {
                hits[i].fetch_add(1, O::Relaxed);
            });
            for (i, hit) in hits.iter().enumerate() {
                assert_eq!(hit.load(O::Relaxed), 1, "index {} of {}", i, count);
            }
        }

        pool.shut_down().wait();
    }

    #[test]
    fn for_range_offset_range() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(3);

        let sum = Counter::new(0);
        dispatcher.for_range(10..20, |i| {
            sum.fetch_add(i, O::Relaxed);
        });
        assert_eq!(sum.load(O::Relaxed), (10..20).sum::<usize>());

        pool.shut_down().wait();
    }

    #[test]
    #[should_panic]
    fn descending_range_is_an_error() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool);
        dispatcher.for_range(10..0, |_| {});
    }

    #[test]
    fn parallelism_of_one_is_sequential() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(1);

        // Order must be strictly sequential.
        let last = Counter::new(0);
        dispatcher.for_range(1..1001, |i| {
            let previous = last.swap(i, O::SeqCst);
            assert_eq!(previous, i - 1);
        });

        pool.shut_down().wait();
    }

    #[test]
    fn panicking_index_does_not_stop_the_others() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(4);

        let hits: Vec<AtomicU8> = (0..10).map(|_| AtomicU8::new(0)).collect();
        let result = catch_unwind(AssertUnwindSafe(|| {
            dispatcher.for_range(0..10, |i| {
                hits[i].fetch_add(1, O::Relaxed);
                if i == 5 {
                    panic!("boom at 5");
                }
            });
        }));

        // The panic resumed on the caller...
        assert!(result.is_err());
        // ...but only after every index ran.
        for hit in &hits {
            assert_eq!(hit.load(O::Relaxed), 1);
        }

        pool.shut_down().wait();
    }

    #[test]
    fn for_each_mutates_in_place() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(4);

        let mut values: Vec<u64> = (0..10_000).collect();
        dispatcher.for_each(&mut values, |v| *v *= 2);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(*v, i as u64 * 2);
        }

        pool.shut_down().wait();
    }

    #[test]
    fn for_range_local_finalizes_every_batch() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(4);

        let inits = StdArc::new(AtomicU32::new(0));
        let finishes = StdArc::new(AtomicU32::new(0));
        let total = StdArc::new(Counter::new(0));

        dispatcher.for_range_local(
            0..10_000,
            {
                let inits = StdArc::clone(&inits);
                move || {
                    inits.fetch_add(1, O::Relaxed);
                    0usize
                }
            },
            |i, local: &mut usize| {
                *local += i;
            },
            {
                let finishes = StdArc::clone(&finishes);
                let total = StdArc::clone(&total);
                move |local| {
                    finishes.fetch_add(1, O::Relaxed);
                    total.fetch_add(local, O::Relaxed);
                }
            },
        );

        assert_eq!(inits.load(O::Relaxed), finishes.load(O::Relaxed));
        assert_eq!(total.load(O::Relaxed), (0..10_000).sum::<usize>());

        pool.shut_down().wait();
    }

    #[test]
    fn for_each_local_sums_through_locals() {
        let pool = test_pool();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(4);

        let mut values: Vec<u64> = (0..10_000).collect();
        let total = StdArc::new(Counter::new(0));

        dispatcher.for_each_local(
            &mut values,
            || 0u64,
            |v, local: &mut u64| {
                *v += 1;
                *local += *v;
            },
            {
                let total = StdArc::clone(&total);
                move |local| {
                    total.fetch_add(local as usize, O::Relaxed);
                }
            },
        );

        assert_eq!(total.load(O::Relaxed), (1..=10_000).sum::<u64>() as usize);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(*v, i as u64 + 1);
        }

        pool.shut_down().wait();
    }
}
