/// Shutdown
///
/// the shutdown step isn't particularly complicated. Workers can check whether the
/// thread pool is shutting down by reading an atomic that is set when the shutdown
/// starts. Then we have a simple mutex/condvar pair tracking the remaining number of
/// threads to shut down that we can wait on. Unlike a fixed-size pool the count
/// moves both ways while the pool is alive, so threads register themselves when
/// they are spawned.

use crate::sync::{Ordering, AtomicBool, Mutex, Condvar, Arc};

use crate::core::Shared;

pub(crate) struct Shutdown {
    pub is_shutting_down: AtomicBool,
    pub shutdown_mutex: Mutex<u32>,
    pub shutdown_cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(0),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn start(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Registers a spawned thread (worker or gate) before it runs.
    pub fn thread_started(&self) {
        let mut num_threads = self.shutdown_mutex.lock().unwrap();
        *num_threads += 1;
    }

    pub fn wait_shutdown(&self) {
        let mut num_threads = self.shutdown_mutex.lock().unwrap();
        while *num_threads > 0 {
            num_threads = self.shutdown_cond.wait(num_threads).unwrap();
        }
    }

    pub fn worker_has_shut_down(&self) {
        let mut num_threads = self.shutdown_mutex.lock().unwrap();
        *num_threads -= 1;
        if *num_threads == 0 {
            self.shutdown_cond.notify_all();
        }
    }
}

pub struct ShutdownHandle {
    shared: Arc<Shared>
}

impl ShutdownHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        ShutdownHandle { shared }
    }

    /// Waits until every thread of the pool, gate included, has exited.
    pub fn wait(self) {
        self.shared.shutdown.wait_shutdown();
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::ThreadPool;
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_threads in 1..8 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let pool = ThreadPool::builder()
                .with_thread_count(num_threads, num_threads)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build();

            // Threads are created on demand; force them into existence.
            let signal = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
            for _ in 0..num_threads * 4 {
                let signal = std::sync::Arc::clone(&signal);
                pool.queue_work_item(move || {
                    signal.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                });
            }
            while signal.load(Ordering::SeqCst) < num_threads as u32 {
                std::thread::yield_now();
            }

            let handle = pool.shut_down();
            handle.wait();

            assert_eq!(
                INITIALIZED_WORKERS.load(Ordering::SeqCst),
                SHUTDOWN_WORKERS.load(Ordering::SeqCst),
            );
            assert!(INITIALIZED_WORKERS.load(Ordering::SeqCst) >= 1);
        }
    }
}
