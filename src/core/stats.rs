//! Pool statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Statistics about pool utilization and worker churn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live worker processes.
    pub worker_count: usize,

    /// Jobs sent to a worker and not yet answered.
    pub in_flight_tasks: usize,

    /// Jobs waiting for an eligible worker.
    pub backlog_tasks: usize,

    /// Total jobs submitted.
    pub submitted_tasks: u64,

    /// Jobs whose task returned a value.
    pub completed_tasks: u64,

    /// Jobs that failed (task error, lost worker, or pool shutdown).
    pub failed_tasks: u64,

    /// Jobs moved back to the backlog after their worker exited unstarted.
    pub redelivered_tasks: u64,

    /// Worker processes spawned, replacements included.
    pub workers_spawned: u64,

    /// Worker processes that exited.
    pub workers_retired: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub submitted_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub redelivered_tasks: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub workers_retired: AtomicU64,
}

impl PoolCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize, in_flight: usize, backlog: usize) -> PoolStats {
        PoolStats {
            worker_count,
            in_flight_tasks: in_flight,
            backlog_tasks: backlog,
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            redelivered_tasks: self.redelivered_tasks.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_retired: self.workers_retired.load(Ordering::Relaxed),
        }
    }
}
