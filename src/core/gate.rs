//! The gate thread: a low-frequency monitor that keeps the pool from
//! deadlocking when every worker is blocked inside a work item.
//!
//! It wakes up on a fixed period, refreshes the CPU utilization
//! estimate used by the hill climbing controller, and checks for
//! starvation: thread requests outstanding with no successful dequeue
//! for a whole threshold window. On starvation it forces the goal one
//! past the live thread count and wakes a worker directly, bypassing
//! the controller.

use super::Shared;
use crate::sync::{Ordering, Arc, AtomicU32, AtomicU64};

use crossbeam_utils::sync::Parker;

pub(crate) struct GateState {
    /// Timestamp (pool-relative ms) of the last successful dequeue.
    last_dequeue_ms: AtomicU64,
    /// Smoothed percentage of live threads that are processing. Stands
    /// in for an OS CPU time query; good enough to tell "saturated"
    /// from "mostly idle".
    cpu_utilization: AtomicU32,
}

impl GateState {
    pub fn new() -> Self {
        GateState {
            last_dequeue_ms: AtomicU64::new(0),
            cpu_utilization: AtomicU32::new(0),
        }
    }

    pub fn note_dequeue(&self, now_ms: u64) {
        self.last_dequeue_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn cpu_utilization(&self) -> u32 {
        self.cpu_utilization.load(Ordering::Relaxed)
    }
}

pub(crate) fn run(shared: Arc<Shared>, parker: Parker) {
    profiling::register_thread!("gate");

    loop {
        parker.park_timeout(shared.config.gate_interval);
        if shared.shutdown.is_shutting_down() {
            break;
        }

        refresh_cpu_estimate(&shared);
        check_starvation(&shared);
    }

    shared.shutdown.worker_has_shut_down();
}

fn refresh_cpu_estimate(shared: &Arc<Shared>) {
    let counts = shared.counts.load();
    let busy = if counts.existing == 0 {
        0
    } else {
        100 * counts.processing as u32 / counts.existing as u32
    };
    let previous = shared.gate.cpu_utilization.load(Ordering::Relaxed);
    shared
        .gate
        .cpu_utilization
        .store((previous + busy) / 2, Ordering::Relaxed);
}

fn check_starvation(shared: &Arc<Shared>) {
    if shared.queue.outstanding_requests() == 0 {
        return;
    }

    let counts = shared.counts.load();
    let threshold_ms =
        shared.config.starvation_threshold.as_millis() as u64 * counts.goal.max(1) as u64;
    let last_dequeue = shared.gate.last_dequeue_ms.load(Ordering::Relaxed);
    if shared.elapsed_ms().saturating_sub(last_dequeue) < threshold_ms {
        return;
    }

    // Work is sitting in the queues and nothing has picked anything up
    // for a while: every thread is probably blocked. Force one more.
    let forced = shared.counts.update(|mut c| {
        let forced = c.existing as u32 + 1;
        if forced > shared.config.max_threads as u32 || forced <= c.goal as u32 {
            return None;
        }
        c.goal = forced as u16;
        Some(c)
    });

    if let Some((_, new)) = forced {
        shared
            .climbing
            .lock()
            .unwrap()
            .force_change(new.goal as i32);
        super::request_worker(shared);
    }
}
