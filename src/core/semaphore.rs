//! The semaphore workers park on between dispatch rounds.
//!
//! The state is a single atomic word holding the signal count plus the
//! number of threads in each stage of the wait protocol. A waiter first
//! tries to grab a signal directly, then spins for a short while as a
//! registered spinner, and only then blocks on a mutex/condvar pair.
//! Releasers never touch the mutex unless a blocked waiter actually has
//! to be woken, and wake at most `waiters - to_wake` threads so a burst
//! of releases doesn't stampede the condvar.

use crate::sync::{Ordering, AtomicU64, Mutex, Condvar};

use crossbeam_utils::{Backoff, CachePadded};

use std::time::{Duration, Instant};

const SIGNALS_SHIFT: u64 = 0;
const SIGNALS_MASK: u64 = 0xFFFF_FFFF;
const WAITERS_SHIFT: u64 = 32;
const WAITERS_MASK: u64 = 0xFFFF;
const SPINNERS_SHIFT: u64 = 48;
const SPINNERS_MASK: u64 = 0xFF;
const TO_WAKE_SHIFT: u64 = 56;
const TO_WAKE_MASK: u64 = 0xFF;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct State {
    signals: u32,
    waiters: u16,
    spinners: u8,
    to_wake: u8,
}

impl State {
    fn unpack(bits: u64) -> Self {
        State {
            signals: ((bits >> SIGNALS_SHIFT) & SIGNALS_MASK) as u32,
            waiters: ((bits >> WAITERS_SHIFT) & WAITERS_MASK) as u16,
            spinners: ((bits >> SPINNERS_SHIFT) & SPINNERS_MASK) as u8,
            to_wake: ((bits >> TO_WAKE_SHIFT) & TO_WAKE_MASK) as u8,
        }
    }

    fn pack(self) -> u64 {
        ((self.signals as u64) << SIGNALS_SHIFT)
            | ((self.waiters as u64) << WAITERS_SHIFT)
            | ((self.spinners as u64) << SPINNERS_SHIFT)
            | ((self.to_wake as u64) << TO_WAKE_SHIFT)
    }
}

enum SpinnerEntry {
    Acquired,
    Spinning,
    Full,
}

pub(crate) struct Semaphore {
    state: CachePadded<AtomicU64>,
    lock: Mutex<()>,
    cond: Condvar,
    spin_rounds: u32,
}

impl Semaphore {
    pub fn new(spin_rounds: u32) -> Self {
        Semaphore {
            state: CachePadded::new(AtomicU64::new(0)),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            spin_rounds,
        }
    }

    /// Like `AtomicU64::fetch_update` over the unpacked state.
    fn transition<F>(&self, mut f: F) -> Result<State, State>
    where
        F: FnMut(State) -> Option<State>,
    {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let before = State::unpack(current);
            let Some(after) = f(before) else {
                return Err(before);
            };
            match self.state.compare_exchange_weak(
                current,
                after.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(before),
                Err(actual) => current = actual,
            }
        }
    }

    /// Blocks until a signal is acquired or the timeout elapses.
    /// Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        // Uncontended acquire.
        if self.try_take_signal() {
            return true;
        }

        match self.register_spinner() {
            SpinnerEntry::Acquired => return true,
            SpinnerEntry::Spinning => {
                let backoff = Backoff::new();
                for _ in 0..self.spin_rounds {
                    backoff.snooze();
                    #[cfg(loom)]
                    loom::thread::yield_now();
                    if self.try_take_signal_as_spinner() {
                        return true;
                    }
                }
                // Demote to a blocked waiter, unless a signal arrived
                // while we were giving up.
                if !self.spinner_to_waiter() {
                    return true;
                }
            }
            // Spinner lane full, go straight to blocking.
            SpinnerEntry::Full => self.register_waiter(),
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap();
        loop {
            if self.try_take_signal_as_waiter() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                self.cancel_waiter();
                return false;
            }

            guard = self.cond.wait_timeout(guard, deadline - now).unwrap().0;
            self.note_waiter_woken();
        }
    }

    /// Adds `n` signals and wakes up to `n` blocked waiters. Spinners
    /// will pick signals up on their own, so they are counted against
    /// the number of wakes.
    pub fn release(&self, n: u32) {
        debug_assert!(n > 0);
        let mut wake = 0u16;
        let _ = self.transition(|mut s| {
            s.signals = s.signals.saturating_add(n);
            let not_yet_woken = s.waiters.saturating_sub(s.to_wake as u16);
            let covered_by_spinners = s.spinners as u32;
            wake = (n.saturating_sub(covered_by_spinners))
                .min(not_yet_woken as u32)
                .min((TO_WAKE_MASK as u8 - s.to_wake) as u32) as u16;
            s.to_wake += wake as u8;
            Some(s)
        });

        if wake > 0 {
            // Taking and dropping the lock orders this notify after any
            // in-progress waiter transition from "checked, no signal" to
            // "blocked on the condvar".
            std::mem::drop(self.lock.lock().unwrap());
            if wake == 1 {
                self.cond.notify_one();
            } else {
                self.cond.notify_all();
            }
        }
    }

    fn try_take_signal(&self) -> bool {
        self.transition(|mut s| {
            if s.signals == 0 {
                return None;
            }
            s.signals -= 1;
            Some(s)
        })
        .is_ok()
    }

    /// Grabs a pending signal if one showed up, otherwise joins the
    /// spinner lane unless it is full.
    fn register_spinner(&self) -> SpinnerEntry {
        let mut entry = SpinnerEntry::Full;
        let result = self.transition(|mut s| {
            if s.signals > 0 {
                s.signals -= 1;
                entry = SpinnerEntry::Acquired;
                return Some(s);
            }
            if s.spinners as u64 == SPINNERS_MASK {
                return None;
            }
            s.spinners += 1;
            entry = SpinnerEntry::Spinning;
            Some(s)
        });
        match result {
            Ok(_) => entry,
            Err(_) => SpinnerEntry::Full,
        }
    }

    fn try_take_signal_as_spinner(&self) -> bool {
        self.transition(|mut s| {
            if s.signals == 0 {
                return None;
            }
            s.signals -= 1;
            s.spinners -= 1;
            Some(s)
        })
        .is_ok()
    }

    /// Returns false if a signal was consumed instead of registering.
    fn spinner_to_waiter(&self) -> bool {
        let mut became_waiter = false;
        let _ = self.transition(|mut s| {
            s.spinners -= 1;
            if s.signals > 0 {
                s.signals -= 1;
                became_waiter = false;
            } else {
                s.waiters += 1;
                became_waiter = true;
            }
            Some(s)
        });
        became_waiter
    }

    fn register_waiter(&self) {
        let _ = self.transition(|mut s| {
            s.waiters += 1;
            Some(s)
        });
    }

    fn try_take_signal_as_waiter(&self) -> bool {
        self.transition(|mut s| {
            if s.signals == 0 {
                return None;
            }
            s.signals -= 1;
            s.waiters -= 1;
            Some(s)
        })
        .is_ok()
    }

    /// Called every time a blocked waiter comes back from the condvar,
    /// whether it was notified, timed out or woke spuriously. The
    /// in-flight wake credit must be retired even when the signal that
    /// prompted it was taken by somebody else, otherwise later releases
    /// under-count the waiters still needing a notify.
    fn note_waiter_woken(&self) {
        let _ = self.transition(|mut s| {
            if s.to_wake == 0 {
                return None;
            }
            s.to_wake -= 1;
            Some(s)
        });
    }

    fn cancel_waiter(&self) {
        let _ = self.transition(|mut s| {
            s.waiters -= 1;
            if s.to_wake as u16 > s.waiters {
                s.to_wake = s.waiters as u8;
            }
            Some(s)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn wait_times_out() {
        let sem = Semaphore::new(10);
        let start = Instant::now();
        assert!(!sem.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn release_before_wait() {
        let sem = Semaphore::new(10);
        sem.release(2);
        assert!(sem.wait(Duration::from_millis(10)));
        assert!(sem.wait(Duration::from_millis(10)));
        assert!(!sem.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_blocked_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let acquired = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let acquired = Arc::clone(&acquired);
                std::thread::spawn(move || {
                    if sem.wait(Duration::from_secs(10)) {
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        // Give the waiters some time to block.
        std::thread::sleep(Duration::from_millis(50));
        sem.release(4);

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stolen_signal_does_not_starve_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));

        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                let start = Instant::now();
                assert!(sem.wait(Duration::from_secs(3)));
                start.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        // A front-door caller can grab the signal before the notified
        // waiter gets scheduled, leaving a wake credit with no signal
        // behind it. The next release must still wake the waiter.
        sem.release(1);
        let _maybe_stolen = sem.wait(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(100));
        sem.release(1);

        let waited = waiter.join().unwrap();
        assert!(
            waited < Duration::from_secs(2),
            "waiter stuck for {:?}",
            waited
        );
    }

    #[test]
    fn timed_out_waiter_does_not_eat_wakes() {
        let sem = Arc::new(Semaphore::new(0));

        let short = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait(Duration::from_millis(20)))
        };
        assert!(!short.join().unwrap());

        let long = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        sem.release(1);
        assert!(long.join().unwrap());
    }
}
