//! The three thread counters that drive the worker manager, packed into
//! a single atomic word so that they can be read and updated consistently
//! without a lock.
//!
//! - `processing`: threads currently holding a work slot (signaled and
//!   dispatching, or reserved for a thread being woken/created).
//! - `existing`: live worker threads, parked or not.
//! - `goal`: the number of threads the controller currently wants. Moved
//!   by the hill climbing updates and by the starvation monitor.

use crate::sync::{AtomicU64, Ordering};

/// Counts are stored in u16 lanes, so this is the hard ceiling on threads.
pub(crate) const MAX_THREAD_COUNT: u32 = u16::MAX as u32 - 1;

const PROCESSING_SHIFT: u64 = 0;
const EXISTING_SHIFT: u64 = 16;
const GOAL_SHIFT: u64 = 32;
const LANE_MASK: u64 = 0xFFFF;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct ThreadCounts {
    pub processing: u16,
    pub existing: u16,
    pub goal: u16,
}

impl ThreadCounts {
    fn pack(self) -> u64 {
        debug_assert!(self.processing <= self.existing);
        ((self.processing as u64) << PROCESSING_SHIFT)
            | ((self.existing as u64) << EXISTING_SHIFT)
            | ((self.goal as u64) << GOAL_SHIFT)
    }

    fn unpack(bits: u64) -> Self {
        ThreadCounts {
            processing: ((bits >> PROCESSING_SHIFT) & LANE_MASK) as u16,
            existing: ((bits >> EXISTING_SHIFT) & LANE_MASK) as u16,
            goal: ((bits >> GOAL_SHIFT) & LANE_MASK) as u16,
        }
    }
}

pub(crate) struct AtomicCounts {
    bits: AtomicU64,
}

impl AtomicCounts {
    pub fn new(goal: u16) -> Self {
        AtomicCounts {
            bits: AtomicU64::new(ThreadCounts { processing: 0, existing: 0, goal }.pack()),
        }
    }

    pub fn load(&self) -> ThreadCounts {
        ThreadCounts::unpack(self.bits.load(Ordering::Acquire))
    }

    /// Retries `f` in a compare-exchange loop until it either applies or
    /// returns None. Returns the `(before, after)` pair of the applied
    /// transition.
    pub fn update<F>(&self, mut f: F) -> Option<(ThreadCounts, ThreadCounts)>
    where
        F: FnMut(ThreadCounts) -> Option<ThreadCounts>,
    {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let before = ThreadCounts::unpack(current);
            let after = f(before)?;
            match self.bits.compare_exchange_weak(
                current,
                after.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((before, after)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserves a processing slot if the goal allows one more, growing
    /// `existing` when every live thread is already busy. The second
    /// element of the result tells whether a new thread must be spawned.
    pub fn try_reserve_worker(&self) -> Option<(ThreadCounts, bool)> {
        self.update(|mut c| {
            if c.processing >= c.goal {
                return None;
            }
            c.processing += 1;
            if c.existing < c.processing {
                c.existing += 1;
            }
            Some(c)
        })
        .map(|(before, after)| (after, after.existing > before.existing))
    }

    /// Releases a processing slot at the end of a dispatch round.
    /// Tolerates a count of zero: shutdown signals the semaphore
    /// without reservations.
    pub fn release_worker(&self) {
        self.update(|mut c| {
            if c.processing == 0 {
                return None;
            }
            c.processing -= 1;
            Some(c)
        });
    }

    /// A worker that timed out waiting for work exits iff there are more
    /// threads than the goal asks for. Returns true if the caller retired.
    pub fn try_retire(&self) -> bool {
        self.update(|mut c| {
            if c.existing <= c.goal || c.existing <= c.processing {
                return None;
            }
            c.existing -= 1;
            Some(c)
        })
        .is_some()
    }

    /// Removes an exiting thread, e.g. during shutdown.
    pub fn note_worker_exit(&self) {
        self.update(|mut c| {
            if c.existing == 0 {
                return None;
            }
            c.existing -= 1;
            if c.processing > c.existing {
                c.processing = c.existing;
            }
            Some(c)
        });
    }

    /// Rolls back a reservation made by `try_reserve_worker` when the OS
    /// refused to give us a thread, and steps the goal down so we don't
    /// immediately retry.
    pub fn cancel_spawn(&self, min_goal: u16) {
        self.update(|mut c| {
            c.processing = c.processing.saturating_sub(1);
            c.existing = c.existing.saturating_sub(1);
            if c.goal > min_goal {
                c.goal -= 1;
            }
            Some(c)
        });
    }

    /// Moves the goal, clamped to the configured bounds. Returns the goal
    /// actually set.
    pub fn set_goal(&self, goal: u16, min: u16, max: u16) -> u16 {
        let goal = goal.clamp(min, max);
        self.update(|mut c| {
            if c.goal == goal {
                return None;
            }
            c.goal = goal;
            Some(c)
        });
        goal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_release() {
        let counts = AtomicCounts::new(2);

        let (c, spawn) = counts.try_reserve_worker().unwrap();
        assert!(spawn);
        assert_eq!(c, ThreadCounts { processing: 1, existing: 1, goal: 2 });

        let (c, spawn) = counts.try_reserve_worker().unwrap();
        assert!(spawn);
        assert_eq!(c, ThreadCounts { processing: 2, existing: 2, goal: 2 });

        // Goal reached, no more reservations.
        assert!(counts.try_reserve_worker().is_none());

        counts.release_worker();
        let c = counts.load();
        assert_eq!(c, ThreadCounts { processing: 1, existing: 2, goal: 2 });

        // The parked thread is reused, no spawn needed.
        let (c, spawn) = counts.try_reserve_worker().unwrap();
        assert!(!spawn);
        assert_eq!(c, ThreadCounts { processing: 2, existing: 2, goal: 2 });
    }

    #[test]
    fn retire_only_above_goal() {
        let counts = AtomicCounts::new(2);
        counts.try_reserve_worker().unwrap();
        counts.try_reserve_worker().unwrap();
        counts.release_worker();
        counts.release_worker();

        // existing == goal: nobody retires.
        assert!(!counts.try_retire());

        counts.set_goal(1, 1, 8);
        assert!(counts.try_retire());
        assert_eq!(counts.load(), ThreadCounts { processing: 0, existing: 1, goal: 1 });
        assert!(!counts.try_retire());
    }

    #[test]
    fn goal_clamped() {
        let counts = AtomicCounts::new(4);
        assert_eq!(counts.set_goal(100, 2, 8), 8);
        assert_eq!(counts.set_goal(0, 2, 8), 2);
        assert_eq!(counts.load().goal, 2);
    }

    #[test]
    fn spawn_rollback() {
        let counts = AtomicCounts::new(4);
        counts.try_reserve_worker().unwrap();
        counts.cancel_spawn(1);
        assert_eq!(counts.load(), ThreadCounts { processing: 0, existing: 0, goal: 3 });
    }
}
