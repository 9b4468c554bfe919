use crate::sync::{AtomicBool, Mutex, Ordering};

use std::any::Any;

/// A simple utility to dynamically assert that a section of code or data is
/// accessed by a sngle thread at a time.
///
/// Only use this for debugging.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn new() -> Self where T: Default {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag: Default::default(),
        }
    }

    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (begin): {:?}", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (end): {:?}", self.tag);
    }
}

/// Stores the first panic payload captured during a parallel operation.
///
/// Any number of threads may race to store, only the first wins and the
/// rest are dropped. The owner of the operation takes the payload after
/// all participants are done and rethrows it.
pub(crate) struct PanicSlot {
    claimed: AtomicBool,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PanicSlot {
    pub fn new() -> Self {
        PanicSlot {
            claimed: AtomicBool::new(false),
            payload: Mutex::new(None),
        }
    }

    pub fn store(&self, panic: Box<dyn Any + Send>) {
        if !self.claimed.swap(true, Ordering::AcqRel) {
            *self.payload.lock().unwrap() = Some(panic);
        }
    }

    pub fn has_panic(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Must only be called once every thread that could store is done.
    pub fn take(&self) -> Option<Box<dyn Any + Send>> {
        if self.claimed.swap(false, Ordering::AcqRel) {
            self.payload.lock().unwrap().take()
        } else {
            None
        }
    }
}

#[test]
fn exclu_check_01() {
    let lock = ExclusiveCheck::with_tag(());

    lock.begin();
    lock.end();

    lock.begin();
    lock.end();

    lock.begin();
    lock.end();
}

#[test]
#[should_panic]
fn exclu_check_02() {
    let lock = ExclusiveCheck::with_tag(());

    lock.begin();
    lock.begin();

    lock.end();
    lock.end();
}

#[test]
fn panic_slot_first_wins() {
    let slot = PanicSlot::new();
    assert!(!slot.has_panic());

    slot.store(Box::new("first"));
    slot.store(Box::new("second"));
    assert!(slot.has_panic());

    let payload = slot.take().unwrap();
    assert_eq!(*payload.downcast::<&str>().unwrap(), "first");
    assert!(slot.take().is_none());
}
