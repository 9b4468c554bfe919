pub mod counts;
pub mod climbing;
pub mod gate;
pub mod job;
pub mod queue;
pub mod semaphore;
pub mod thread_pool;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_deque::Worker as WorkerQueue;
use crossbeam_utils::{CachePadded, sync::{Parker, Unparker}};

use sync::{Arc, Mutex, Ordering, AtomicU32, AtomicU64, thread};
use counts::AtomicCounts;
use climbing::HillClimbing;
use gate::GateState;
use job::{WorkItem, ForkRef};
use queue::{WorkQueue, FastRand};
use semaphore::Semaphore;
use thread_pool::{ThreadPool, ThreadPoolBuilder, ThreadPoolId};
use shutdown::Shutdown;

use crate::dispatch::BatchCoord;
use crate::sort::SortCoord;
use crate::pool::ConcurrentPool;

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_THREADPOOL_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
static NEXT_RAND_SEED: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0x1234_5678);

/// How many spin rounds a worker goes through on the semaphore before
/// blocking for real.
const SEMAPHORE_SPIN_ROUNDS: u32 = 70;

pub(crate) struct PoolConfig {
    pub min_threads: u16,
    pub max_threads: u16,
    /// How long a worker waits for a signal before considering retirement.
    pub idle_timeout: Duration,
    /// Period of the gate thread.
    pub gate_interval: Duration,
    /// Per-goal-thread starvation window, see `gate`.
    pub starvation_threshold: Duration,
    /// CPU utilization percentage above which the controller refuses to
    /// add threads.
    pub high_cpu_threshold: u32,
    pub name_handler: Box<dyn Fn(u32) -> String + Send + Sync>,
    pub stack_size: Option<usize>,
}

/// Data accessible from any thread.
///
/// If you are familiar with rayon's code, this is somewhat equivalent to their
/// `Registry` struct.
pub(crate) struct Shared {
    pub config: PoolConfig,
    /// The processing/existing/goal triple, in one atomic word.
    pub counts: AtomicCounts,
    /// Global injector, per-worker deques and thread request tracking.
    pub queue: WorkQueue,
    /// What workers park on between dispatch rounds.
    pub semaphore: Semaphore,
    /// State shared with the gate thread.
    pub gate: GateState,
    gate_wake: Unparker,
    /// The thread count controller, fed from the completion path.
    pub climbing: Mutex<HillClimbing>,
    completions: CachePadded<AtomicU64>,
    sample_interval_ms: AtomicU32,
    last_adjustment_ms: AtomicU64,
    epoch: Instant,
    next_worker_id: AtomicU32,
    /// Recycled coordination blocks for the fork-join operations.
    pub batch_coords: ConcurrentPool<Arc<BatchCoord>>,
    pub sort_coords: ConcurrentPool<Arc<SortCoord>>,
    /// A unique ID per thread pool to sanity-check that we aren't trying
    /// to move work from a pool to another if there several of them.
    pub id: ThreadPoolId,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    // A few hooks to register work
    handlers: ThreadPoolHooks,
}

impl Shared {
    pub fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Called by workers after each executed item. Returns false when
    /// the worker should stop taking work because the goal dropped
    /// below the number of processing threads.
    pub fn notify_work_item_complete(&self) -> bool {
        let total = self.completions.fetch_add(1, Ordering::Relaxed) + 1;
        let now = self.elapsed_ms();
        let last = self.last_adjustment_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.sample_interval_ms.load(Ordering::Relaxed) as u64
            && !self.shutdown.is_shutting_down()
        {
            self.adjust_goal(now, total);
        }

        let counts = self.counts.load();
        counts.processing <= counts.goal
    }

    fn adjust_goal(&self, now_ms: u64, total_completions: u64) {
        // Whoever holds the lock is already taking care of this sample.
        let Ok(mut climbing) = self.climbing.try_lock() else {
            return;
        };

        // Re-check under the lock.
        let last = self.last_adjustment_ms.load(Ordering::Relaxed);
        let elapsed_ms = now_ms.saturating_sub(last);
        if elapsed_ms < self.sample_interval_ms.load(Ordering::Relaxed) as u64 {
            return;
        }
        let completions = total_completions.saturating_sub(climbing.completions_at_last_sample);
        if completions == 0 {
            return;
        }

        let counts = self.counts.load();
        let (new_goal, interval_ms) = climbing.update(
            counts.goal as i32,
            elapsed_ms as f64 / 1000.0,
            completions as i32,
            self.gate.cpu_utilization(),
            self.config.high_cpu_threshold,
        );

        climbing.completions_at_last_sample = total_completions;
        self.last_adjustment_ms.store(now_ms, Ordering::Relaxed);
        self.sample_interval_ms.store(interval_ms, Ordering::Relaxed);

        if new_goal != counts.goal as i32 {
            self.counts.set_goal(
                new_goal as u16,
                self.config.min_threads,
                self.config.max_threads,
            );
        }
    }

    /// Dequeues and runs one pending work item, if any. Used by threads
    /// blocked on a fork-join operation to make progress instead of
    /// just spinning.
    pub fn try_cooperate(&self) -> bool {
        let mut missed_steal = false;
        let item = COOP_RAND.with(|seed| {
            let mut rand = FastRand::new(seed.get());
            let item = match current_local_queue(self.id) {
                Some((queue, worker)) => unsafe {
                    self.queue
                        .dequeue(Some((&*queue, worker)), &mut rand, &mut missed_steal)
                },
                None => self.queue.dequeue(None, &mut rand, &mut missed_steal),
            };
            seed.set(rand.next());
            item
        });

        let Some(item) = item else {
            return false;
        };

        self.gate.note_dequeue(self.elapsed_ms());
        let _ = catch_unwind(AssertUnwindSafe(move || item.execute()));
        self.notify_work_item_complete();
        true
    }
}

thread_local! {
    static LOCAL_QUEUE: Cell<Option<LocalQueue>> = const { Cell::new(None) };
    static COOP_RAND: Cell<u32> = Cell::new(NEXT_RAND_SEED.fetch_add(0x9E37_79B9, std::sync::atomic::Ordering::Relaxed));
}

/// Raw handle to the deque owned by the current worker thread. The
/// pointer is only dereferenced from that same thread, and the worker
/// clears the slot before its deque is dropped.
#[derive(Copy, Clone)]
struct LocalQueue {
    pool: ThreadPoolId,
    worker: u32,
    queue: *const WorkerQueue<WorkItem>,
}

fn current_local_queue(pool: ThreadPoolId) -> Option<(*const WorkerQueue<WorkItem>, u32)> {
    LOCAL_QUEUE.with(|slot| match slot.get() {
        Some(local) if local.pool == pool => Some((local.queue, local.worker)),
        _ => None,
    })
}

/// Pushes a one-shot closure, using the local deque when called from
/// one of the pool's own workers.
pub(crate) fn queue_work_item(shared: &Arc<Shared>, item: WorkItem) {
    match current_local_queue(shared.id) {
        Some((queue, _)) => unsafe { (*queue).push(item) },
        None => shared.queue.push(item),
    }
    ensure_thread_requested(shared);
}

/// Pushes `n` copies of a fork-join item to the global queue so every
/// worker can see them. The caller keeps the pointed-to data alive
/// until all copies have executed.
pub(crate) unsafe fn queue_replicated(shared: &Arc<Shared>, fork: ForkRef, n: usize) {
    assert!(n > 0, "cannot queue zero copies of a fork-join item");
    for _ in 0..n {
        shared.queue.push(WorkItem::Forked(fork));
    }
    for _ in 0..n {
        ensure_thread_requested(shared);
    }
}

pub(crate) fn ensure_thread_requested(shared: &Arc<Shared>) {
    if shared.queue.try_add_thread_request() {
        request_worker(shared);
    }
}

/// Makes sure a worker will pick pending work up: reserve a processing
/// slot if the goal allows one, spawn a thread if they are all busy,
/// and signal the semaphore. Every signal matches a reservation, so a
/// woken worker starts its round with a slot already held. When the
/// goal's worth of threads is already processing there is nothing to
/// do; they will find the work in their dispatch loop.
pub(crate) fn request_worker(shared: &Arc<Shared>) {
    if let Some((_, must_spawn)) = shared.counts.try_reserve_worker() {
        if must_spawn {
            spawn_worker(shared);
        }
        shared.semaphore.release(1);
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);

    let mut builder = thread::Builder::new().name((shared.config.name_handler)(id));
    if let Some(stack_size) = shared.config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    shared.shutdown.thread_started();

    let for_worker = Arc::clone(shared);
    let spawned = builder.spawn(move || {
        profiling::register_thread!("Worker");

        worker_run(for_worker, id);
    });

    if spawned.is_err() {
        // The OS refused to give us a thread. Undo the reservation and
        // step the goal down so we don't hammer the OS with retries.
        shared.shutdown.worker_has_shut_down();
        shared.counts.cancel_spawn(shared.config.min_threads);
    }
}

fn worker_run(shared: Arc<Shared>, id: u32) {
    let local = WorkerQueue::new_lifo();
    shared.queue.register(id, local.stealer());
    LOCAL_QUEUE.with(|slot| {
        slot.set(Some(LocalQueue {
            pool: shared.id,
            worker: id,
            queue: &local,
        }))
    });

    if let Some(handler) = &shared.handlers.start {
        handler.run(id);
    }

    let mut rand = FastRand::new(id.wrapping_add(1).wrapping_mul(0x9E37_79B9));
    let mut retired = false;

    loop {
        let signaled = shared.semaphore.wait(shared.config.idle_timeout);

        if shared.shutdown.is_shutting_down() {
            if signaled {
                shared.counts.release_worker();
            }
            break;
        }

        if signaled {
            dispatch(&shared, &local, id, &mut rand);
            shared.counts.release_worker();
        } else if shared.counts.try_retire() {
            retired = true;
            break;
        }
    }

    LOCAL_QUEUE.with(|slot| slot.set(None));
    shared.queue.deregister(id, &local);
    if !retired {
        shared.counts.note_worker_exit();
    }

    if let Some(handler) = &shared.handlers.exit {
        handler.run(id);
    }

    shared.shutdown.worker_has_shut_down();
}

/// One dispatch round: run work items until the queues look empty or
/// the controller asks this thread to back off.
fn dispatch(shared: &Arc<Shared>, local: &WorkerQueue<WorkItem>, id: u32, rand: &mut FastRand) {
    profiling::scope!("dispatch");

    shared.queue.mark_thread_request_satisfied();

    // Whether this thread must re-request a worker on the way out. True
    // by default: if we stop because of an error or a goal decrease,
    // remaining work still needs a thread.
    let request_on_exit;

    loop {
        let mut missed_steal = false;
        let Some(item) = shared.queue.dequeue(Some((local, id)), rand, &mut missed_steal) else {
            // Empty queues, unless a steal was missed; then somebody
            // has items and every other thread may be going to sleep.
            request_on_exit = missed_steal;
            break;
        };

        shared.gate.note_dequeue(shared.elapsed_ms());

        // There may be more work behind the item we just took.
        ensure_thread_requested(shared);

        // A panicking work item must not take the worker down with it.
        let _ = catch_unwind(AssertUnwindSafe(move || item.execute()));

        if !shared.notify_work_item_complete() {
            // The controller wants fewer threads processing.
            request_on_exit = true;
            break;
        }
    }

    if request_on_exit {
        ensure_thread_requested(shared);
    }
}

pub(crate) fn init(params: ThreadPoolBuilder) -> ThreadPool {
    let num_processors = thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);

    let min_threads = params.min_threads;
    let max_threads = params.max_threads.max(min_threads);

    let gate_parker = Parker::new();
    let gate_wake = gate_parker.unparker().clone();

    let climbing = HillClimbing::new(
        params.climbing,
        min_threads,
        max_threads,
        NEXT_RAND_SEED.fetch_add(0x9E37_79B9, std::sync::atomic::Ordering::Relaxed),
    );
    let sample_interval_ms = climbing.current_sample_interval_ms();

    let shared = Arc::new(Shared {
        config: PoolConfig {
            min_threads,
            max_threads,
            idle_timeout: params.idle_timeout,
            gate_interval: params.gate_interval,
            starvation_threshold: params.starvation_threshold,
            high_cpu_threshold: params.high_cpu_threshold,
            name_handler: params.name_handler,
            stack_size: params.stack_size,
        },
        counts: AtomicCounts::new(min_threads),
        queue: WorkQueue::new(num_processors),
        semaphore: Semaphore::new(SEMAPHORE_SPIN_ROUNDS),
        gate: GateState::new(),
        gate_wake,
        climbing: Mutex::new(climbing),
        completions: CachePadded::new(AtomicU64::new(0)),
        sample_interval_ms: AtomicU32::new(sample_interval_ms),
        last_adjustment_ms: AtomicU64::new(0),
        epoch: Instant::now(),
        next_worker_id: AtomicU32::new(0),
        batch_coords: ConcurrentPool::new(8, || Arc::new(BatchCoord::new())),
        sort_coords: ConcurrentPool::new(8, || Arc::new(SortCoord::new())),
        id: ThreadPoolId(NEXT_THREADPOOL_ID.fetch_add(1, Ordering::Relaxed)),
        shutdown: Shutdown::new(),
        handlers: ThreadPoolHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    // The gate thread counts like a worker for shutdown purposes.
    shared.shutdown.thread_started();
    let for_gate = Arc::clone(&shared);
    // Worker spawn failures are recoverable, but a pool without its
    // starvation monitor is broken from the start: failing to spawn the
    // gate at construction is fatal.
    thread::Builder::new()
        .name("Gate".into())
        .spawn(move || gate::run(for_gate, gate_parker))
        .unwrap();

    ThreadPool { shared }
}

pub(crate) fn begin_shut_down(shared: Arc<Shared>) -> shutdown::ShutdownHandle {
    shared.shutdown.start();

    // Wake every parked worker so they notice the flag, and the gate.
    shared.semaphore.release(shared.config.max_threads as u32);
    shared.gate_wake.unpark();

    shutdown::ShutdownHandle::new(shared)
}

pub(crate) struct ThreadPoolHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
