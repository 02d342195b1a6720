//! Tests for worker selection policies

use prometheus_process_pool::core::scheduler::scheduler_for;
use prometheus_process_pool::core::{LeastOutstanding, RoundRobin, Scheduler, WorkerLoad};
use prometheus_process_pool::SchedulerKind;

fn load(worker_id: u64, outstanding: usize) -> WorkerLoad {
    WorkerLoad {
        worker_id,
        outstanding,
        assigned: 0,
    }
}

#[test]
fn test_round_robin_skips_retired_workers() {
    let mut rr = RoundRobin::default();
    let all = [load(1, 0), load(2, 0), load(3, 0)];
    assert_eq!(rr.select(&all), Some(1));
    assert_eq!(rr.select(&all), Some(2));

    // Worker 3 retired and worker 4 replaced it.
    let replaced = [load(1, 0), load(2, 0), load(4, 0)];
    assert_eq!(rr.select(&replaced), Some(4));
    assert_eq!(rr.select(&replaced), Some(1));
}

#[test]
fn test_round_robin_empty() {
    let mut rr = RoundRobin::default();
    assert_eq!(rr.select(&[]), None);
    assert_eq!(rr.select(&[load(8, 0)]), Some(8));
}

#[test]
fn test_least_outstanding() {
    let mut lo = LeastOutstanding;
    assert_eq!(lo.select(&[load(1, 3), load(2, 1), load(3, 1)]), Some(2));
    assert_eq!(lo.select(&[load(1, 0), load(2, 0)]), Some(1));
    assert_eq!(lo.select(&[]), None);
}

#[test]
fn test_scheduler_for_kind() {
    assert_eq!(scheduler_for(SchedulerKind::RoundRobin).name(), "round_robin");
    assert_eq!(
        scheduler_for(SchedulerKind::LeastOutstanding).name(),
        "least_outstanding"
    );
}
