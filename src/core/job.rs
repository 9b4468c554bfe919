use std::mem;

/// What gets pushed/popped/stolen from the queues.
///
/// Boxed one-shot closures for externally submitted work, and shared
/// references into a fork-join operation for the data-parallel layer.
pub(crate) enum WorkItem {
    Once(Box<dyn FnOnce() + Send>),
    Forked(ForkRef),
}

impl WorkItem {
    pub fn execute(self) {
        match self {
            WorkItem::Once(f) => f(),
            WorkItem::Forked(fork) => unsafe { fork.execute() },
        }
    }
}

/// A fork-join work item advertised to other threads so that they can
/// come help with a batched operation.
///
/// This trait is heavily inspired by rayon's `Job` trait.
pub(crate) trait ForkJob {
    /// Unsafe: this may be called from a different thread than the one
    /// which scheduled the job, so the implementer must ensure the
    /// appropriate traits are met, whether `Send`, `Sync`, or both.
    unsafe fn execute(this: *const Self);
}

/// Effectively a `ForkJob` trait object with type and lifetime erased,
/// pointing into the stack frame of the thread that forked.
///
/// Internally, we store the job's data in a `*const ()` pointer. The
/// true type is something like `*const BatchJob<...>`, but we hide it.
/// We also carry the "execute fn" from the `ForkJob` trait.
///
/// The interesting parts of this type are taken from Rayon.
///
/// Several copies of the same ForkRef are pushed at once, all pointing
/// at the same data. The forking thread **must** keep the data alive
/// until every copy has been executed (it blocks on a reference count
/// that each execution decrements).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ForkRef {
    pointer: *const (),
    execute_fn: unsafe fn(*const ()),
}

unsafe impl Send for ForkRef {}
unsafe impl Sync for ForkRef {}

impl ForkRef {
    /// Unsafe: caller asserts that `data` will remain valid until the
    /// last copy of the returned ref is executed.
    pub unsafe fn new<T>(data: *const T) -> ForkRef
    where
        T: ForkJob,
    {
        let fn_ptr: unsafe fn(*const T) = <T as ForkJob>::execute;
        // erase types:
        ForkRef {
            pointer: data as *const (),
            execute_fn: mem::transmute(fn_ptr),
        }
    }

    #[inline]
    pub unsafe fn execute(&self) {
        (self.execute_fn)(self.pointer)
    }
}
