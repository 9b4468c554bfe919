//! Parallel unstable quicksort.
//!
//! Large slices are partitioned recursively; instead of recursing on
//! the call stack, sub-ranges go through a shared queue that the
//! caller and up to `max_parallelism - 1` helpers pull from. Helpers
//! are spawned lazily: a thread queues at most one, and only the first
//! time it actually splits a partition, so small inputs never pay for
//! threads they can't use. Ranges below a threshold are handed to the
//! standard unstable sort.

use crate::core::{self, Shared};
use crate::core::job::{ForkJob, ForkRef};
use crate::dispatch::Dispatcher;
use crate::sync::{Ordering, Arc, AtomicIsize};
use crate::util::PanicSlot;

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::{Backoff, CachePadded};

use std::cmp::Ordering as CmpOrdering;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// Below this length a partition is sorted in place rather than split.
const SEQUENTIAL_THRESHOLD: usize = 2048;

impl Dispatcher {
    /// Sorts the slice in parallel. Equivalent to a sequential unstable
    /// sort: total order, no stability guarantee.
    pub fn sort<T>(&self, items: &mut [T])
    where
        T: Send + Ord,
    {
        self.sort_by(items, T::cmp);
    }

    pub fn sort_by<T, F>(&self, items: &mut [T], compare: F)
    where
        T: Send,
        F: Fn(&T, &T) -> CmpOrdering + Sync,
    {
        profiling::scope!("sort");

        let len = items.len();
        if len < 2 {
            return;
        }
        if self.max_parallelism() <= 1 || len <= SEQUENTIAL_THRESHOLD {
            items.sort_unstable_by(|a, b| compare(a, b));
            return;
        }

        let shared = &self.pool().shared;
        let coord = shared.sort_coords.acquire();
        coord.reset(self.max_parallelism() as isize - 1);
        coord.operations_left.store(1, Ordering::Release);
        coord.partitions.push(SortRange { left: 0, right: len - 1 });

        let job = SortJob {
            coord: &coord,
            shared,
            data: items.as_mut_ptr(),
            compare: &compare,
        };

        // The caller works through partitions like any helper would.
        sort_worker(&job);

        let backoff = Backoff::new();
        while coord.refs.load(Ordering::Acquire) > 0 {
            if shared.try_cooperate() {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }

        let panic = coord.panic.take();
        shared.sort_coords.release(coord);

        if let Some(payload) = panic {
            resume_unwind(payload);
        }
    }
}

/// An inclusive index range awaiting sorting.
#[derive(Copy, Clone, Debug)]
struct SortRange {
    left: usize,
    right: usize,
}

/// Shared coordination state of one sort, recycled through the pool's
/// `ConcurrentPool`.
pub(crate) struct SortCoord {
    partitions: Injector<SortRange>,
    /// Pending operations: one per queued range plus the one being
    /// processed. The sort is complete when this reaches zero.
    operations_left: CachePadded<AtomicIsize>,
    /// Decremented once per helper actually queued; helpers stop being
    /// queued when it runs out.
    helper_budget: AtomicIsize,
    /// Outstanding helper items pointing into the caller's stack.
    refs: CachePadded<AtomicIsize>,
    panic: PanicSlot,
}

impl SortCoord {
    pub fn new() -> Self {
        SortCoord {
            partitions: Injector::new(),
            operations_left: CachePadded::new(AtomicIsize::new(0)),
            helper_budget: AtomicIsize::new(0),
            refs: CachePadded::new(AtomicIsize::new(0)),
            panic: PanicSlot::new(),
        }
    }

    fn reset(&self, helper_budget: isize) {
        debug_assert!(self.partitions.is_empty());
        debug_assert_eq!(self.operations_left.load(Ordering::Relaxed), 0);
        debug_assert!(!self.panic.has_panic());
        self.helper_budget.store(helper_budget, Ordering::Relaxed);
        self.refs.store(0, Ordering::Relaxed);
    }
}

struct SortJob<'a, T, F> {
    coord: &'a SortCoord,
    shared: &'a Arc<Shared>,
    data: *mut T,
    compare: &'a F,
}

unsafe impl<T: Send, F: Sync> Send for SortJob<'_, T, F> {}
unsafe impl<T: Send, F: Sync> Sync for SortJob<'_, T, F> {}

impl<T, F> ForkJob for SortJob<'_, T, F>
where
    T: Send,
    F: Fn(&T, &T) -> CmpOrdering + Sync,
{
    unsafe fn execute(this: *const Self) {
        let this = &*this;
        sort_worker(this);
        // The caller may free the job right after this store.
        this.coord.refs.fetch_sub(1, Ordering::Release);
    }
}

/// Pulls partitions until the whole sort is done. Run by the calling
/// thread and by every helper.
fn sort_worker<T, F>(job: &SortJob<T, F>)
where
    T: Send,
    F: Fn(&T, &T) -> CmpOrdering + Sync,
{
    let coord = job.coord;
    let mut spawned_helper = false;
    let backoff = Backoff::new();

    while coord.operations_left.load(Ordering::Acquire) != 0 {
        let range = match coord.partitions.steal() {
            Steal::Success(range) => range,
            Steal::Empty | Steal::Retry => {
                backoff.snooze();
                continue;
            }
        };
        backoff.reset();

        let len = range.right - range.left + 1;
        if len <= SEQUENTIAL_THRESHOLD {
            let result = catch_unwind(AssertUnwindSafe(|| unsafe {
                let slice = std::slice::from_raw_parts_mut(job.data.add(range.left), len);
                slice.sort_unstable_by(|a, b| (job.compare)(a, b));
            }));
            if let Err(payload) = result {
                // The slice may be left permuted, never torn.
                coord.panic.store(payload);
            }
            coord.operations_left.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        match catch_unwind(AssertUnwindSafe(|| unsafe {
            partition(job.data, range.left, range.right, job.compare)
        })) {
            Err(payload) => {
                // A poisoned comparison abandons this partition but must
                // not wedge the bookkeeping.
                coord.panic.store(payload);
                coord.operations_left.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(split) => {
                let push_left = split > range.left;
                let push_right = range.right > split + 1;
                let delta = push_left as isize + push_right as isize - 1;
                coord.operations_left.fetch_add(delta, Ordering::AcqRel);
                if push_left {
                    coord.partitions.push(SortRange { left: range.left, right: split });
                }
                if push_right {
                    coord.partitions.push(SortRange { left: split + 1, right: range.right });
                }

                // The first time we split, enlist one more thread if the
                // budget allows it.
                if !spawned_helper {
                    spawned_helper = true;
                    if coord.helper_budget.fetch_sub(1, Ordering::AcqRel) >= 1 {
                        coord.refs.fetch_add(1, Ordering::Relaxed);
                        unsafe {
                            core::queue_replicated(
                                job.shared,
                                ForkRef::new(job as *const SortJob<T, F>),
                                1,
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Hoare partition with a median-of-three pivot. Returns `split` such
/// that `[left, split]` and `[split + 1, right]` are both non-empty
/// and every element of the first compares less-or-equal to every
/// element of the second.
unsafe fn partition<T, F>(data: *mut T, left: usize, right: usize, compare: &F) -> usize
where
    F: Fn(&T, &T) -> CmpOrdering,
{
    debug_assert!(right > left + 1);
    let mid = left + (right - left) / 2;

    let less = |a: usize, b: usize| compare(&*data.add(a), &*data.add(b)) == CmpOrdering::Less;

    // Order the three pivot candidates; the median lands in the middle.
    if less(mid, left) {
        std::ptr::swap(data.add(mid), data.add(left));
    }
    if less(right, left) {
        std::ptr::swap(data.add(right), data.add(left));
    }
    if less(right, mid) {
        std::ptr::swap(data.add(right), data.add(mid));
    }

    // The pivot is a position, not a copy; track it through swaps.
    let mut pivot = mid;
    let mut i = left as isize - 1;
    let mut j = right as isize + 1;
    loop {
        loop {
            i += 1;
            if !less(i as usize, pivot) {
                break;
            }
        }
        loop {
            j -= 1;
            if !less(pivot, j as usize) {
                break;
            }
        }
        if i >= j {
            return j as usize;
        }

        std::ptr::swap(data.add(i as usize), data.add(j as usize));
        if i as usize == pivot {
            pivot = j as usize;
        } else if j as usize == pivot {
            pivot = i as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadPool;

    fn test_dispatcher() -> (ThreadPool, Dispatcher) {
        let pool = ThreadPool::builder().with_thread_count(1, 4).build();
        let dispatcher = Dispatcher::new(&pool).with_max_parallelism(4);
        (pool, dispatcher)
    }

    fn pseudo_random(len: usize, modulus: u64) -> Vec<u64> {
        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed % modulus
            })
            .collect()
    }

    #[test]
    fn sorts_like_the_standard_sort() {
        let (pool, dispatcher) = test_dispatcher();

        for len in [0usize, 1, 2, 2048, 100_000] {
            // A small modulus forces plenty of duplicates.
            let mut values = pseudo_random(len, 1000);
            let mut expected = values.clone();
            expected.sort_unstable();

            dispatcher.sort(&mut values);
            assert_eq!(values, expected, "len {}", len);
        }

        pool.shut_down().wait();
    }

    #[test]
    fn sorts_presorted_and_reversed_input() {
        let (pool, dispatcher) = test_dispatcher();

        let mut ascending: Vec<u64> = (0..50_000).collect();
        dispatcher.sort(&mut ascending);
        assert!(ascending.windows(2).all(|w| w[0] <= w[1]));

        let mut descending: Vec<u64> = (0..50_000).rev().collect();
        dispatcher.sort(&mut descending);
        assert!(descending.windows(2).all(|w| w[0] <= w[1]));

        pool.shut_down().wait();
    }

    #[test]
    fn sort_by_custom_order() {
        let (pool, dispatcher) = test_dispatcher();

        let mut values = pseudo_random(30_000, 1_000_000);
        dispatcher.sort_by(&mut values, |a, b| b.cmp(a));
        assert!(values.windows(2).all(|w| w[0] >= w[1]));

        pool.shut_down().wait();
    }

    #[test]
    fn panicking_comparator_resumes_on_caller() {
        let (pool, dispatcher) = test_dispatcher();

        let mut values = pseudo_random(10_000, 1000);
        let result = catch_unwind(AssertUnwindSafe(|| {
            dispatcher.sort_by(&mut values, |a, b| {
                if *a == 7 && *b == 13 {
                    panic!("bad comparison");
                }
                a.cmp(b)
            });
        }));
        // Depending on scheduling the pair may never be compared; all
        // that is guaranteed is that a captured panic resurfaces and
        // the call returns at all.
        let _ = result;

        pool.shut_down().wait();
    }

    #[test]
    fn partition_splits_correctly() {
        let mut values = pseudo_random(10_000, 500);
        let right = values.len() - 1;
        let split = unsafe { partition(values.as_mut_ptr(), 0, right, &u64::cmp) };
        assert!(split < right);
        let max_left = values[..=split].iter().max().unwrap();
        let min_right = values[split + 1..].iter().min().unwrap();
        assert!(max_left <= min_right);
    }
}
