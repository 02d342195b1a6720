//! Worker selection policies.
//!
//! The dispatcher hands a scheduler the eligible workers (alive, not closing,
//! under quota), sorted by worker id, and routes the job to whichever id comes
//! back.

use crate::config::SchedulerKind;

/// Load snapshot of one eligible worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLoad {
    /// Coordinator-assigned worker id.
    pub worker_id: u64,
    /// Jobs sent but not yet answered.
    pub outstanding: usize,
    /// Jobs sent over the worker's lifetime.
    pub assigned: u64,
}

/// Picks a target worker for the next job.
pub trait Scheduler: Send {
    /// Choose among `candidates` (sorted by id). `None` when empty.
    fn select(&mut self, candidates: &[WorkerLoad]) -> Option<u64>;

    /// Policy name for logs.
    fn name(&self) -> &'static str;
}

/// Rotate through workers in id order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<u64>,
}

impl Scheduler for RoundRobin {
    fn select(&mut self, candidates: &[WorkerLoad]) -> Option<u64> {
        let next = self
            .last
            .and_then(|last| candidates.iter().find(|c| c.worker_id > last))
            .or_else(|| candidates.first())?
            .worker_id;
        self.last = Some(next);
        Some(next)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Prefer the worker with the fewest unanswered jobs; lowest id wins ties.
#[derive(Debug, Default)]
pub struct LeastOutstanding;

impl Scheduler for LeastOutstanding {
    fn select(&mut self, candidates: &[WorkerLoad]) -> Option<u64> {
        candidates
            .iter()
            .min_by_key(|c| (c.outstanding, c.worker_id))
            .map(|c| c.worker_id)
    }

    fn name(&self) -> &'static str {
        "least_outstanding"
    }
}

/// Instantiate the configured policy.
#[must_use]
pub fn scheduler_for(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::RoundRobin => Box::new(RoundRobin::default()),
        SchedulerKind::LeastOutstanding => Box::new(LeastOutstanding),
    }
}
