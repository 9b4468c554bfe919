//! An adaptive multithreaded work scheduler.
//!
//! The pool grows and shrinks its worker thread count on its own: a
//! hill climbing controller perturbs the count and watches throughput
//! to find the productive level for the current workload, while a gate
//! thread watches for starvation (everything blocked, work piling up)
//! and forces extra threads when it hits. Individual work items flow
//! through per-worker stealing deques plus a global queue.
//!
//! On top of the pool, [`Dispatcher`] provides fork-join data parallel
//! loops and sorting, and [`ConcurrentCollector`]/[`ConcurrentPool`]
//! cover the two collection patterns this kind of scheduling keeps
//! running into: gathering results from many threads, and recycling
//! coordination objects without allocating.
//!
//! What we want:
//! - No implicit global thread pool.
//! - Thread counts that adapt to the workload instead of pinning one
//!   thread per core forever.
//! - Loops that block the submitting thread as little as possible, and
//!   make it useful while it waits.
//! - Avoid hoarding CPU resources in worker threads that don't have
//!   work to execute (this is at the cost of higher latency).

mod core;
mod collector;
mod dispatch;
mod pool;
mod sort;
pub mod util;

pub use crate::core::climbing::ClimbingConfig;
pub use crate::core::thread_pool::{ThreadPool, ThreadPoolId, ThreadPoolBuilder, ThreadCountsSnapshot};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::sync;
pub use crate::core::WorkerHook;
pub use collector::ConcurrentCollector;
pub use dispatch::Dispatcher;
pub use pool::ConcurrentPool;

pub use crossbeam_utils::CachePadded;
