//! The queue set work items flow through.
//!
//! Each worker owns a LIFO deque that only it pushes to and pops from;
//! everything else goes through a global FIFO injector. Idle workers
//! steal from each other starting at a random position so they don't
//! all gang up on the same victim.
//!
//! The set also tracks how many wake/create requests are in flight so
//! that a flood of submissions doesn't request more threads than there
//! are processors.

use super::job::WorkItem;
use crate::sync::{Ordering, AtomicU32, RwLock};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::CachePadded;

pub(crate) struct WorkQueue {
    injector: Injector<WorkItem>,
    stealers: RwLock<Vec<(u32, Stealer<WorkItem>)>>,
    // Number of unsatisfied thread requests, capped at the processor
    // count. A dispatching worker decrements this when it starts.
    outstanding_requests: CachePadded<AtomicU32>,
    num_processors: u32,
}

impl WorkQueue {
    pub fn new(num_processors: u32) -> Self {
        WorkQueue {
            injector: Injector::new(),
            stealers: RwLock::new(Vec::new()),
            outstanding_requests: CachePadded::new(AtomicU32::new(0)),
            num_processors: num_processors.max(1),
        }
    }

    pub fn push(&self, item: WorkItem) {
        self.injector.push(item);
    }

    pub fn register(&self, worker: u32, stealer: Stealer<WorkItem>) {
        let mut stealers = self.stealers.write().unwrap();
        debug_assert!(!stealers.iter().any(|(id, _)| *id == worker));
        stealers.push((worker, stealer));
    }

    /// Removes the worker's stealer and moves whatever is left in its
    /// deque back into the global queue, so no item is stranded on a
    /// dead thread.
    pub fn deregister(&self, worker: u32, local: &Worker<WorkItem>) {
        let mut stealers = self.stealers.write().unwrap();
        stealers.retain(|(id, _)| *id != worker);
        while let Some(item) = local.pop() {
            self.injector.push(item);
        }
    }

    /// Grabs the next work item: local deque first, then the global
    /// queue, then a steal attempt on every other worker starting at a
    /// random index.
    ///
    /// A contended steal (the victim's queue moved under us) is not
    /// retried; `missed_steal` is set instead and the caller requests
    /// another thread once it is busy executing, so the items we may
    /// have seen are picked up by somebody.
    pub fn dequeue(
        &self,
        local: Option<(&Worker<WorkItem>, u32)>,
        rand: &mut FastRand,
        missed_steal: &mut bool,
    ) -> Option<WorkItem> {
        if let Some((queue, _)) = local {
            if let Some(item) = queue.pop() {
                return Some(item);
            }
        }

        loop {
            let steal = match local {
                Some((queue, _)) => self.injector.steal_batch_and_pop(queue),
                None => self.injector.steal(),
            };
            match steal {
                Steal::Success(item) => return Some(item),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }

        let stealers = self.stealers.read().unwrap();
        let len = stealers.len();
        if len == 0 {
            return None;
        }
        let own_id = local.map(|(_, id)| id);
        let start = rand.next_max(len as u32) as usize;
        for i in 0..len {
            let (id, stealer) = &stealers[(start + i) % len];
            if Some(*id) == own_id {
                continue;
            }
            match stealer.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => {}
                Steal::Retry => {
                    *missed_steal = true;
                }
            }
        }

        None
    }

    /// Returns true if the caller took responsibility for a new thread
    /// request and must wake or create a worker.
    pub fn try_add_thread_request(&self) -> bool {
        let mut count = self.outstanding_requests.load(Ordering::Relaxed);
        loop {
            if count >= self.num_processors {
                return false;
            }
            match self.outstanding_requests.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Called by a worker at the start of a dispatch round, making room
    /// for further requests.
    pub fn mark_thread_request_satisfied(&self) {
        let mut count = self.outstanding_requests.load(Ordering::Relaxed);
        while count > 0 {
            match self.outstanding_requests.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
    }

    pub fn outstanding_requests(&self) -> u32 {
        self.outstanding_requests.load(Ordering::Acquire)
    }
}

/// Xorshift generator for the steal scan's starting position.
pub(crate) struct FastRand {
    w: u32,
    x: u32,
    y: u32,
    z: u32,
}

impl FastRand {
    pub fn new(seed: u32) -> Self {
        FastRand {
            w: seed | 1,
            x: 0x6C07_8965,
            y: 0x846C_A68B,
            z: 0x9E37_79B9,
        }
    }

    pub fn next(&mut self) -> u32 {
        let t = self.x ^ (self.x << 11);
        self.x = self.y;
        self.y = self.z;
        self.z = self.w;
        self.w = self.w ^ (self.w >> 19) ^ (t ^ (t >> 8));
        self.w
    }

    /// A value in `0..max`.
    pub fn next_max(&mut self, max: u32) -> u32 {
        debug_assert!(max > 0);
        self.next() % max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn once(counter: &'static AtomicU32) -> WorkItem {
        WorkItem::Once(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn dequeue_priority() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let queue = WorkQueue::new(4);
        let local = Worker::new_lifo();
        queue.register(0, local.stealer());

        queue.push(once(&COUNTER));
        local.push(once(&COUNTER));

        let mut rand = FastRand::new(1);
        let mut missed = false;

        // The local item comes out first.
        let mut found = 0;
        while queue
            .dequeue(Some((&local, 0)), &mut rand, &mut missed)
            .is_some()
        {
            found += 1;
        }
        assert_eq!(found, 2);
        assert!(!missed);
        queue.deregister(0, &local);
    }

    #[test]
    fn drain_on_deregister() {
        let queue = WorkQueue::new(4);
        let local = Worker::new_lifo();
        queue.register(7, local.stealer());
        for _ in 0..10 {
            local.push(WorkItem::Once(Box::new(|| {})));
        }

        queue.deregister(7, &local);

        // Everything is back in the global queue, visible without a
        // local deque.
        let mut rand = FastRand::new(2);
        let mut missed = false;
        let mut found = 0;
        while queue.dequeue(None, &mut rand, &mut missed).is_some() {
            found += 1;
        }
        assert_eq!(found, 10);
    }

    #[test]
    fn thread_requests_capped() {
        let queue = WorkQueue::new(2);
        assert!(queue.try_add_thread_request());
        assert!(queue.try_add_thread_request());
        assert!(!queue.try_add_thread_request());

        queue.mark_thread_request_satisfied();
        assert_eq!(queue.outstanding_requests(), 1);
        assert!(queue.try_add_thread_request());

        // Satisfying with no request outstanding is a no-op.
        queue.mark_thread_request_satisfied();
        queue.mark_thread_request_satisfied();
        queue.mark_thread_request_satisfied();
        assert_eq!(queue.outstanding_requests(), 0);
    }

    #[test]
    fn steal_from_other_worker() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let queue = WorkQueue::new(4);
        let victim = Worker::new_lifo();
        queue.register(0, victim.stealer());
        victim.push(once(&COUNTER));

        let thief = Worker::new_lifo();
        queue.register(1, thief.stealer());

        let mut rand = FastRand::new(3);
        let mut missed = false;
        let item = queue.dequeue(Some((&thief, 1)), &mut rand, &mut missed);
        assert!(item.is_some());
        item.unwrap().execute();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
    }
}
