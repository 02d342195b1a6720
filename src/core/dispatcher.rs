//! Job routing, result correlation, and worker replacement for one pool.
//!
//! All mutable pool state sits in [`DispatchState`] behind one
//! `parking_lot::Mutex`. Critical sections are short and never span an
//! `.await`; replies to callers are sent after the lock is released.
//!
//! Each worker gets a supervisor task that drains its outbound channel,
//! reaps the process once its stdout closes, and reports the exit back so
//! the dispatcher can redeliver, fail, and replace.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::core::pool_worker::{PoolWorker, WorkerOptions};
use crate::core::process::ProcessInfo;
use crate::core::protocol::{JobEnvelope, ResultEnvelope, TaskId, WorkRequest, WorkResponse};
use crate::core::scheduler::{scheduler_for, Scheduler, WorkerLoad};
use crate::core::stats::{PoolCounters, PoolStats};
use crate::core::PoolError;

pub(crate) type Reply = oneshot::Sender<Result<Value, PoolError>>;

struct WorkerSlot {
    name: String,
    pid: Option<u32>,
    inbound: mpsc::UnboundedSender<WorkRequest>,
    max_tasks: Option<u64>,
    assigned: u64,
    outstanding: usize,
    produced: u64,
    kill: Option<oneshot::Sender<()>>,
    closing: bool,
}

impl WorkerSlot {
    fn eligible(&self) -> bool {
        !self.closing && self.max_tasks.is_none_or(|quota| self.assigned < quota)
    }

    fn kill(&mut self) {
        self.closing = true;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

struct PendingTask {
    job: JobEnvelope,
    reply: Reply,
    worker: Option<u64>,
    started: bool,
}

struct DispatchState {
    workers: BTreeMap<u64, WorkerSlot>,
    pending: HashMap<TaskId, PendingTask>,
    backlog: VecDeque<TaskId>,
    scheduler: Box<dyn Scheduler>,
    next_worker_id: u64,
    consecutive_crashes: u32,
    respawn: bool,
    closing: bool,
    fault: Option<String>,
}

/// Replies to send once the lock is released.
type Failures = Vec<(Reply, PoolError)>;

impl DispatchState {
    fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            workers: BTreeMap::new(),
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            scheduler,
            next_worker_id: 1,
            consecutive_crashes: 0,
            respawn: true,
            closing: false,
            fault: None,
        }
    }

    fn select_worker(&mut self) -> Option<u64> {
        let candidates: Vec<WorkerLoad> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.eligible())
            .map(|(&worker_id, slot)| WorkerLoad {
                worker_id,
                outstanding: slot.outstanding,
                assigned: slot.assigned,
            })
            .collect();
        self.scheduler.select(&candidates)
    }

    /// Route backlog jobs, oldest first, until no worker is eligible.
    fn flush_backlog(&mut self) {
        while let Some(&task_id) = self.backlog.front() {
            let Some(worker_id) = self.select_worker() else {
                break;
            };
            self.backlog.pop_front();
            let (Some(task), Some(slot)) = (
                self.pending.get_mut(&task_id),
                self.workers.get_mut(&worker_id),
            ) else {
                continue;
            };
            if slot.inbound.send(WorkRequest::Job(task.job.clone())).is_err() {
                // Writer gone: the child is exiting and its supervisor will report it.
                slot.closing = true;
                self.backlog.push_front(task_id);
                continue;
            }
            slot.assigned += 1;
            slot.outstanding += 1;
            task.worker = Some(worker_id);
            debug!(task_id, worker_id, "Job dispatched");
        }
    }

    fn fail_backlog(&mut self, make_err: impl Fn(TaskId) -> PoolError) -> Failures {
        let ids: Vec<TaskId> = self.backlog.drain(..).collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|t| (t.reply, make_err(id))))
            .collect()
    }

    fn fail_all(&mut self, make_err: impl Fn(TaskId) -> PoolError) -> Failures {
        self.backlog.clear();
        self.pending
            .drain()
            .map(|(id, t)| (t.reply, make_err(id)))
            .collect()
    }

    fn kill_all(&mut self) {
        for slot in self.workers.values_mut() {
            slot.kill();
        }
    }
}

pub(crate) struct Shared {
    pool_id: String,
    config: PoolConfig,
    options: WorkerOptions,
    state: Mutex<DispatchState>,
    next_task_id: AtomicU64,
    counters: PoolCounters,
    live: watch::Sender<usize>,
}

impl Shared {
    fn send_failures(&self, failures: Failures) {
        for (reply, err) in failures {
            PoolCounters::incr(&self.counters.failed_tasks);
            let _ = reply.send(Err(err));
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<(), PoolError> {
        let worker_id = {
            let mut st = self.state.lock();
            let id = st.next_worker_id;
            st.next_worker_id += 1;
            id
        };

        let mut worker = PoolWorker::new(worker_id, self.options.clone());
        worker.start()?;
        let inbound = worker
            .inbound()
            .ok_or_else(|| PoolError::Internal("pool worker has no inbound channel".into()))?;
        let (kill_tx, kill_rx) = oneshot::channel();

        {
            let mut st = self.state.lock();
            if st.closing {
                // Dropping the handle kills the child.
                return Ok(());
            }
            st.workers.insert(
                worker_id,
                WorkerSlot {
                    name: worker.name().to_string(),
                    pid: worker.pid(),
                    inbound,
                    max_tasks: worker.max_tasks(),
                    assigned: 0,
                    outstanding: 0,
                    produced: 0,
                    kill: Some(kill_tx),
                    closing: false,
                },
            );
            self.live.send_modify(|n| *n += 1);
            PoolCounters::incr(&self.counters.workers_spawned);
            st.flush_backlog();
        }

        debug!(pool = %self.pool_id, worker_id, pid = ?worker.pid(), "Worker spawned");
        tokio::spawn(supervise(Arc::clone(self), worker, kill_rx));
        Ok(())
    }

    fn submit(
        &self,
        task: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> (TaskId, oneshot::Receiver<Result<Value, PoolError>>) {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        PoolCounters::incr(&self.counters.submitted_tasks);

        let rejected = {
            let mut st = self.state.lock();
            if let Some(fault) = &st.fault {
                Some((reply, PoolError::Protocol(fault.clone())))
            } else if st.closing {
                Some((reply, PoolError::PoolClosed))
            } else if !st.respawn && st.workers.is_empty() {
                Some((reply, PoolError::WorkerLost { task_id }))
            } else {
                let job = JobEnvelope::new(task_id, task, args).with_kwargs(kwargs);
                st.pending.insert(
                    task_id,
                    PendingTask {
                        job,
                        reply,
                        worker: None,
                        started: false,
                    },
                );
                st.backlog.push_back(task_id);
                st.flush_backlog();
                None
            }
        };

        if let Some(failure) = rejected {
            self.send_failures(vec![failure]);
        }
        (task_id, rx)
    }

    fn handle_response(&self, worker_id: u64, response: WorkResponse) {
        match response {
            WorkResponse::Started { task_id } => {
                let mut st = self.state.lock();
                let known = match st.pending.get_mut(&task_id) {
                    Some(task) if task.worker == Some(worker_id) => {
                        task.started = true;
                        true
                    }
                    _ => false,
                };
                let closing = st.closing;
                drop(st);
                if known {
                    debug!(task_id, worker_id, "Job started");
                } else if closing {
                    debug!(task_id, worker_id, "Start notice after shutdown");
                } else {
                    self.fault(format!("worker {worker_id} started unknown task {task_id}"));
                }
            }
            WorkResponse::Result(ResultEnvelope { task_id, outcome }) => {
                let task = {
                    let mut st = self.state.lock();
                    let matches = st
                        .pending
                        .get(&task_id)
                        .is_some_and(|t| t.worker == Some(worker_id));
                    if matches {
                        if let Some(slot) = st.workers.get_mut(&worker_id) {
                            slot.outstanding = slot.outstanding.saturating_sub(1);
                            slot.produced += 1;
                        }
                        st.pending.remove(&task_id)
                    } else if st.closing {
                        debug!(task_id, worker_id, "Result after shutdown dropped");
                        return;
                    } else {
                        None
                    }
                };

                let Some(task) = task else {
                    self.fault(format!("worker {worker_id} answered unknown task {task_id}"));
                    return;
                };
                if outcome.is_ok() {
                    PoolCounters::incr(&self.counters.completed_tasks);
                } else {
                    PoolCounters::incr(&self.counters.failed_tasks);
                }
                debug!(task_id, worker_id, ok = outcome.is_ok(), "Job finished");
                let _ = task.reply.send(outcome.into_result());
            }
        }
    }

    /// Tear the pool down after a protocol violation.
    fn fault(&self, reason: String) {
        let failures = {
            let mut st = self.state.lock();
            if st.fault.is_some() {
                return;
            }
            error!(pool = %self.pool_id, reason = %reason, "Protocol error, shutting pool down");
            st.fault = Some(reason.clone());
            st.closing = true;
            st.kill_all();
            st.fail_all(|_| PoolError::Protocol(reason.clone()))
        };
        self.send_failures(failures);
    }

    /// Kill every worker and fail everything outstanding with `PoolClosed`.
    fn abort(&self) {
        let failures = {
            let mut st = self.state.lock();
            st.closing = true;
            st.kill_all();
            st.fail_all(|_| PoolError::PoolClosed)
        };
        self.send_failures(failures);
    }

    fn on_worker_exit(self: &Arc<Self>, worker_id: u64, crashed: bool) {
        let (failures, respawn) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(slot) = st.workers.remove(&worker_id) else {
                return;
            };
            self.live.send_modify(|n| *n = n.saturating_sub(1));
            PoolCounters::incr(&self.counters.workers_retired);

            let mut failures = Failures::new();
            let mut redeliver = Vec::new();
            let mut lost = Vec::new();
            for (&task_id, task) in &mut st.pending {
                if task.worker != Some(worker_id) {
                    continue;
                }
                if task.started {
                    lost.push(task_id);
                } else {
                    task.worker = None;
                    redeliver.push(task_id);
                }
            }
            for task_id in lost {
                if let Some(task) = st.pending.remove(&task_id) {
                    warn!(pool = %self.pool_id, task_id, worker_id, "Worker lost a running job");
                    failures.push((task.reply, PoolError::WorkerLost { task_id }));
                }
            }

            if st.closing {
                for task_id in redeliver {
                    if let Some(task) = st.pending.remove(&task_id) {
                        failures.push((task.reply, PoolError::PoolClosed));
                    }
                }
            } else if !redeliver.is_empty() {
                redeliver.sort_unstable();
                debug!(worker_id, count = redeliver.len(), "Redelivering unstarted jobs");
                for &task_id in redeliver.iter().rev() {
                    st.backlog.push_front(task_id);
                }
                self.counters
                    .redelivered_tasks
                    .fetch_add(redeliver.len() as u64, Ordering::Relaxed);
            }

            if crashed && slot.produced == 0 {
                st.consecutive_crashes += 1;
                warn!(
                    pool = %self.pool_id,
                    worker_id,
                    crashes = st.consecutive_crashes,
                    "Worker exited abnormally"
                );
                if st.consecutive_crashes >= self.config.max_consecutive_crashes && st.respawn {
                    error!(pool = %self.pool_id, "Workers keep crashing, no longer respawning");
                    st.respawn = false;
                }
            } else {
                st.consecutive_crashes = 0;
            }

            if !st.respawn {
                if st.workers.is_empty() {
                    failures.extend(st.fail_backlog(|task_id| PoolError::WorkerLost { task_id }));
                } else if !st.closing {
                    // No replacement is coming; surviving workers take the redelivered jobs.
                    st.flush_backlog();
                }
            }

            info!(pool = %self.pool_id, worker_id, name = %slot.name, crashed, "Worker exited");
            (failures, st.respawn && !st.closing)
        };

        self.send_failures(failures);
        if respawn {
            self.replace_worker();
        }
    }

    /// Spawn a replacement. Spawn failures count as crashes; once the guard
    /// trips, surviving workers take the backlog, or it fails if none are left.
    fn replace_worker(self: &Arc<Self>) {
        loop {
            let Err(e) = self.spawn_worker() else {
                return;
            };
            let (failures, retry) = {
                let mut st = self.state.lock();
                st.consecutive_crashes += 1;
                error!(
                    pool = %self.pool_id,
                    error = %e,
                    crashes = st.consecutive_crashes,
                    "Failed to spawn replacement worker"
                );
                if st.consecutive_crashes >= self.config.max_consecutive_crashes {
                    st.respawn = false;
                }
                let retry = st.respawn && !st.closing;
                let failures = if st.closing {
                    Failures::new()
                } else if st.workers.is_empty() {
                    if retry {
                        Failures::new()
                    } else {
                        st.fail_backlog(|_| PoolError::ProcessStart(e.to_string()))
                    }
                } else {
                    st.flush_backlog();
                    Failures::new()
                };
                (failures, retry)
            };
            self.send_failures(failures);
            if !retry {
                return;
            }
        }
    }

    async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut live = self.live.subscribe();
        let idle = tokio::time::timeout(timeout, live.wait_for(|n| *n == 0))
            .await
            .is_ok();
        idle
    }
}

/// Drain one worker's output until its stdout closes, then reap it.
async fn supervise(shared: Arc<Shared>, mut worker: PoolWorker, mut kill: oneshot::Receiver<()>) {
    let worker_id = worker.worker_id();
    let mut killed = false;

    loop {
        let event = tokio::select! {
            _ = &mut kill, if !killed => None,
            message = worker.get() => Some(message),
        };
        match event {
            None => {
                killed = true;
                if let Err(e) = worker.terminate().await {
                    warn!(worker_id, error = %e, "Failed to kill worker");
                }
            }
            Some(Ok(response)) => shared.handle_response(worker_id, response),
            Some(Err(PoolError::ChannelClosed)) => break,
            Some(Err(e @ PoolError::Protocol(_))) => shared.fault(e.to_string()),
            Some(Err(e)) => warn!(worker_id, error = %e, "Worker output failed"),
        }
    }

    let crashed = match worker.join(Some(shared.config.shutdown_timeout())).await {
        Ok(status) => !killed && !status.success(),
        Err(e) => {
            warn!(worker_id, error = %e, "Worker did not exit after closing stdout, killing");
            let _ = worker.terminate().await;
            !killed
        }
    };
    shared.on_worker_exit(worker_id, crashed);
}

/// Coordinator for one pool's workers.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub(crate) fn start(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let options = WorkerOptions {
            max_tasks: config.max_tasks_per_child,
            concurrency: config.child_concurrency,
            initializer: config.initializer.as_ref().map(|spec| {
                JobEnvelope::new(0, spec.task.clone(), spec.args.clone())
                    .with_kwargs(spec.kwargs.clone())
            }),
            process: config.process.clone(),
        };
        let pool_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let (live, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            pool_id,
            state: Mutex::new(DispatchState::new(scheduler_for(config.scheduler))),
            config,
            options,
            next_task_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
            live,
        });

        for _ in 0..shared.config.processes {
            if let Err(e) = shared.spawn_worker() {
                shared.abort();
                return Err(e);
            }
        }
        info!(
            pool = %shared.pool_id,
            processes = shared.config.processes,
            scheduler = ?shared.config.scheduler,
            "Pool started"
        );
        Ok(Self { shared })
    }

    pub(crate) fn submit(
        &self,
        task: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> (TaskId, oneshot::Receiver<Result<Value, PoolError>>) {
        self.shared.submit(task, args, kwargs)
    }

    pub(crate) fn pool_id(&self) -> &str {
        &self.shared.pool_id
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.state.lock().closing
    }

    pub(crate) fn processes(&self) -> Vec<ProcessInfo> {
        let st = self.shared.state.lock();
        st.workers
            .iter()
            .map(|(&worker_id, slot)| ProcessInfo {
                worker_id,
                name: slot.name.clone(),
                pid: slot.pid,
                assigned: slot.assigned,
                outstanding: slot.outstanding,
            })
            .collect()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let st = self.shared.state.lock();
        let in_flight = st.pending.values().filter(|t| t.worker.is_some()).count();
        self.shared
            .counters
            .snapshot(st.workers.len(), in_flight, st.backlog.len())
    }

    /// Graceful shutdown: workers finish what they were sent, then exit.
    pub(crate) async fn close(&self) {
        let failures = {
            let mut st = self.shared.state.lock();
            st.closing = true;
            for slot in st.workers.values_mut() {
                slot.closing = true;
                let _ = slot.inbound.send(WorkRequest::Exit);
            }
            st.fail_backlog(|_| PoolError::PoolClosed)
        };
        self.shared.send_failures(failures);

        let timeout = self.shared.config.shutdown_timeout();
        if !self.shared.wait_idle(timeout).await {
            warn!(pool = %self.shared.pool_id, ?timeout, "Workers still busy at shutdown, killing");
            self.shared.state.lock().kill_all();
            if !self.shared.wait_idle(timeout).await {
                warn!(pool = %self.shared.pool_id, "Workers not reaped after kill");
            }
        }

        // Anything left can no longer complete.
        self.shared.abort();
        info!(pool = %self.shared.pool_id, "Pool closed");
    }

    /// Immediate shutdown: kill workers, fail outstanding jobs.
    pub(crate) async fn terminate(&self) {
        self.shared.abort();
        if !self.shared.wait_idle(self.shared.config.shutdown_timeout()).await {
            warn!(pool = %self.shared.pool_id, "Workers not reaped after kill");
        }
        info!(pool = %self.shared.pool_id, "Pool terminated");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerKind;

    fn state_with_workers(
        quotas: &[Option<u64>],
    ) -> (DispatchState, Vec<mpsc::UnboundedReceiver<WorkRequest>>) {
        let mut st = DispatchState::new(scheduler_for(SchedulerKind::RoundRobin));
        let mut receivers = Vec::new();
        for (i, quota) in quotas.iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            st.workers.insert(
                i as u64 + 1,
                WorkerSlot {
                    name: format!("w{}", i + 1),
                    pid: None,
                    inbound: tx,
                    max_tasks: *quota,
                    assigned: 0,
                    outstanding: 0,
                    produced: 0,
                    kill: None,
                    closing: false,
                },
            );
        }
        (st, receivers)
    }

    fn enqueue(
        st: &mut DispatchState,
        task_id: TaskId,
    ) -> oneshot::Receiver<Result<Value, PoolError>> {
        let (reply, rx) = oneshot::channel();
        st.pending.insert(
            task_id,
            PendingTask {
                job: JobEnvelope::new(task_id, "t", Vec::new()),
                reply,
                worker: None,
                started: false,
            },
        );
        st.backlog.push_back(task_id);
        rx
    }

    fn job_ids(rx: &mut mpsc::UnboundedReceiver<WorkRequest>) -> Vec<TaskId> {
        let mut ids = Vec::new();
        while let Ok(WorkRequest::Job(job)) = rx.try_recv() {
            ids.push(job.task_id);
        }
        ids
    }

    #[test]
    fn test_flush_round_robin() {
        let (mut st, mut rxs) = state_with_workers(&[None, None]);
        let _replies: Vec<_> = (1..=4).map(|id| enqueue(&mut st, id)).collect();
        st.flush_backlog();
        assert!(st.backlog.is_empty());
        assert_eq!(job_ids(&mut rxs[0]), vec![1, 3]);
        assert_eq!(job_ids(&mut rxs[1]), vec![2, 4]);
        assert_eq!(st.workers[&1].outstanding, 2);
    }

    #[test]
    fn test_quota_leaves_jobs_in_backlog() {
        let (mut st, mut rxs) = state_with_workers(&[Some(1), Some(2)]);
        let _replies: Vec<_> = (1..=5).map(|id| enqueue(&mut st, id)).collect();
        st.flush_backlog();
        assert_eq!(job_ids(&mut rxs[0]), vec![1]);
        assert_eq!(job_ids(&mut rxs[1]), vec![2, 3]);
        assert_eq!(st.backlog.iter().copied().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(st.pending[&4].worker, None);
    }

    #[test]
    fn test_dead_inbound_keeps_job() {
        let (mut st, mut rxs) = state_with_workers(&[None, None]);
        drop(rxs.remove(0));
        let _reply = enqueue(&mut st, 1);
        st.flush_backlog();
        assert!(st.workers[&1].closing);
        assert_eq!(job_ids(&mut rxs[0]), vec![1]);
        assert_eq!(st.pending[&1].worker, Some(2));
    }

    #[tokio::test]
    async fn test_fail_backlog_replies() {
        let (mut st, _rxs) = state_with_workers(&[]);
        let rx = enqueue(&mut st, 9);
        let failures = st.fail_backlog(|task_id| PoolError::WorkerLost { task_id });
        assert!(st.pending.is_empty());
        for (reply, err) in failures {
            let _ = reply.send(Err(err));
        }
        assert!(matches!(rx.await, Ok(Err(PoolError::WorkerLost { task_id: 9 }))));
    }
}
