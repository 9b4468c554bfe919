use super::{Shared, WorkerHook};
use super::sync::Arc;
use super::climbing::ClimbingConfig;
use super::counts::MAX_THREAD_COUNT;
use super::job::WorkItem;
use super::shutdown::ShutdownHandle;

use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadPoolId(pub(crate) u32);

/// A reference to a thread pool.
///
/// The pool spawns worker threads on demand and retires them when they
/// have been idle for a while, keeping the live count between the
/// configured minimum and maximum under the direction of a hill
/// climbing controller. Threads are only fully torn down by an explicit
/// `shut_down`.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
}

/// A consistent snapshot of the pool's thread counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadCountsSnapshot {
    /// Threads currently executing or reserved for execution.
    pub processing: u32,
    /// Live worker threads, parked or not.
    pub existing: u32,
    /// The count the controller is currently aiming for.
    pub goal: u32,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        let num_processors = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
            .min(MAX_THREAD_COUNT) as u16;

        ThreadPoolBuilder {
            min_threads: 1,
            max_threads: num_processors,
            idle_timeout: Duration::from_secs(20),
            gate_interval: Duration::from_millis(500),
            starvation_threshold: Duration::from_millis(500),
            high_cpu_threshold: 95,
            climbing: ClimbingConfig::default(),
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Submits a one-shot closure. It runs exactly once, on whichever
    /// worker gets to it first.
    pub fn queue_work_item<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        super::queue_work_item(&self.shared, WorkItem::Once(Box::new(job)));
    }

    /// Dequeues and executes one pending work item on the calling
    /// thread, if there is any. Returns false when the queues were
    /// empty.
    pub fn try_cooperate(&self) -> bool {
        self.shared.try_cooperate()
    }

    pub fn shut_down(&self) -> ShutdownHandle {
        super::begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn id(&self) -> ThreadPoolId {
        self.shared.id
    }

    pub fn min_threads(&self) -> u32 { self.shared.config.min_threads as u32 }

    pub fn max_threads(&self) -> u32 { self.shared.config.max_threads as u32 }

    pub fn thread_counts(&self) -> ThreadCountsSnapshot {
        let counts = self.shared.counts.load();
        ThreadCountsSnapshot {
            processing: counts.processing as u32,
            existing: counts.existing as u32,
            goal: counts.goal as u32,
        }
    }
}

pub struct ThreadPoolBuilder {
    pub(crate) min_threads: u16,
    pub(crate) max_threads: u16,
    pub(crate) idle_timeout: Duration,
    pub(crate) gate_interval: Duration,
    pub(crate) starvation_threshold: Duration,
    pub(crate) high_cpu_threshold: u32,
    pub(crate) climbing: ClimbingConfig,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String + Send + Sync>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    /// Bounds for the adaptive thread count. The controller and the
    /// starvation monitor move the goal within `min..=max`.
    pub fn with_thread_count(mut self, min: u16, max: u16) -> Self {
        assert!(min >= 1, "the pool needs at least one thread");
        assert!(min <= max, "min thread count {} above max {}", min, max);
        assert!((max as u32) <= MAX_THREAD_COUNT);
        self.min_threads = min;
        self.max_threads = max;
        self
    }

    /// How long an above-goal worker stays parked before exiting.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Period of the starvation monitor thread.
    pub fn with_gate_interval(mut self, interval: Duration) -> Self {
        self.gate_interval = interval;
        self
    }

    /// Base window without any dequeue after which the pool is
    /// considered starved. Scaled by the current thread count goal.
    pub fn with_starvation_threshold(mut self, threshold: Duration) -> Self {
        self.starvation_threshold = threshold;
        self
    }

    pub fn with_climbing_config(mut self, config: ClimbingConfig) -> Self {
        self.climbing = config;
        self
    }

    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + Send + Sync + 'static
    {
        self.name_handler = Box::new(handler);
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn build(self) -> ThreadPool {
        crate::core::init(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn work_items_all_run() {
        let pool = ThreadPool::builder().with_thread_count(1, 4).build();
        let counter = StdArc::new(AtomicU32::new(0));

        for _ in 0..1000 {
            let counter = StdArc::clone(&counter);
            pool.queue_work_item(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        while counter.load(Ordering::Relaxed) < 1000 {
            std::thread::yield_now();
        }

        pool.shut_down().wait();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn panicking_item_does_not_kill_workers() {
        let pool = ThreadPool::builder().with_thread_count(1, 2).build();
        let counter = StdArc::new(AtomicU32::new(0));

        pool.queue_work_item(|| panic!("oops"));
        for _ in 0..10 {
            let counter = StdArc::clone(&counter);
            pool.queue_work_item(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        while counter.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }

        pool.shut_down().wait();
    }

    #[test]
    fn counts_stay_in_bounds() {
        let pool = ThreadPool::builder().with_thread_count(2, 4).build();
        let counter = StdArc::new(AtomicU32::new(0));

        for _ in 0..200 {
            let counter = StdArc::clone(&counter);
            pool.queue_work_item(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        while counter.load(Ordering::Relaxed) < 200 {
            let counts = pool.thread_counts();
            assert!(counts.processing <= counts.existing);
            assert!(counts.existing <= 4);
            assert!(counts.goal >= 2 && counts.goal <= 4);
            std::thread::yield_now();
        }

        pool.shut_down().wait();
    }

    #[test]
    fn idle_workers_retire_toward_min() {
        let pool = ThreadPool::builder()
            .with_thread_count(1, 4)
            .with_idle_timeout(Duration::from_millis(20))
            .build();
        let counter = StdArc::new(AtomicU32::new(0));

        // A burst that forces several threads into existence.
        for _ in 0..500 {
            let counter = StdArc::clone(&counter);
            pool.queue_work_item(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_micros(100));
            });
        }
        while counter.load(Ordering::Relaxed) < 500 {
            std::thread::yield_now();
        }

        // Then a quiet period; the extra threads must drain away.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let counts = pool.thread_counts();
            if counts.existing <= counts.goal {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "still {} threads for goal {}",
                counts.existing,
                counts.goal,
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        pool.shut_down().wait();
    }

    #[test]
    fn cooperate_runs_pending_work() {
        let pool = ThreadPool::builder().with_thread_count(1, 1).build();
        let counter = StdArc::new(AtomicU32::new(0));

        {
            let counter = StdArc::clone(&counter);
            pool.queue_work_item(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        // Either the single worker picks it up or we do it ourselves.
        while counter.load(Ordering::Relaxed) == 0 {
            pool.try_cooperate();
            std::thread::yield_now();
        }

        pool.shut_down().wait();
    }
}
