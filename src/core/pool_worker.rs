//! Long-lived pool worker: a child process serving jobs until its quota runs out.
//!
//! Jobs go in through an unbounded inbound channel drained into the child's
//! stdin by a writer task, so [`PoolWorker::put`] never waits. A reader task
//! decodes the child's stdout into the outbound channel consumed by
//! [`PoolWorker::get`].

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::config::ProcessConfig;
use crate::core::process::ManagedProcess;
use crate::core::protocol::{ChildSpec, JobEnvelope, ResultEnvelope, WorkRequest, WorkResponse};
use crate::core::PoolError;
use crate::infra::ipc::LineReader;

type Outbound = mpsc::UnboundedReceiver<Result<WorkResponse, PoolError>>;

/// How a pool worker's child behaves.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Jobs to complete before the child exits; `None` is unbounded.
    pub max_tasks: Option<u64>,
    /// Jobs the child runs at once.
    pub concurrency: usize,
    /// Job run once in the child before it serves.
    pub initializer: Option<JobEnvelope>,
    /// How the child is launched.
    pub process: ProcessConfig,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_tasks: None,
            concurrency: 1,
            initializer: None,
            process: ProcessConfig::default(),
        }
    }
}

/// Coordinator-side handle to one pool worker process.
#[derive(Debug)]
pub struct PoolWorker {
    worker_id: u64,
    max_tasks: Option<u64>,
    process: ManagedProcess,
    outbound: Option<Outbound>,
}

impl PoolWorker {
    /// Create an unstarted worker.
    #[must_use]
    pub fn new(worker_id: u64, options: WorkerOptions) -> Self {
        let spec = ChildSpec::Pool {
            name: format!("{}-worker-{worker_id}", options.process.name_prefix),
            worker_id,
            max_tasks: options.max_tasks,
            concurrency: options.concurrency.max(1),
            initializer: options.initializer,
        };
        Self {
            worker_id,
            max_tasks: options.max_tasks,
            process: ManagedProcess::from_spec(spec, options.process, true),
            outbound: None,
        }
    }

    /// Create a worker that retires after `max_tasks` jobs.
    #[must_use]
    pub fn with_quota(worker_id: u64, max_tasks: u64) -> Self {
        Self::new(
            worker_id,
            WorkerOptions {
                max_tasks: Some(max_tasks),
                ..WorkerOptions::default()
            },
        )
    }

    /// Spawn the child and start reading its responses.
    ///
    /// # Errors
    ///
    /// See [`ManagedProcess::start`].
    pub fn start(&mut self) -> Result<(), PoolError> {
        self.process.start()?;
        let stdout = self
            .process
            .take_stdout()
            .ok_or_else(|| PoolError::Internal("pool worker stdout not captured".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_responses(self.process.name().to_string(), stdout, tx));
        self.outbound = Some(rx);
        debug!(worker_id = self.worker_id, pid = ?self.pid(), "Pool worker started");
        Ok(())
    }

    /// Queue a job for the child. Never waits.
    ///
    /// # Errors
    ///
    /// `NotStarted` before `start`, `ChannelClosed` once the child is gone.
    pub fn put(&self, job: JobEnvelope) -> Result<(), PoolError> {
        self.process.send(WorkRequest::Job(job))
    }

    /// Ask the child to finish its queued jobs and exit.
    ///
    /// # Errors
    ///
    /// `NotStarted` before `start`, `ChannelClosed` once the child is gone.
    pub fn request_exit(&self) -> Result<(), PoolError> {
        self.process.send(WorkRequest::Exit)
    }

    /// Wait for the next message from the child.
    ///
    /// Cancel safe.
    ///
    /// # Errors
    ///
    /// - `PoolError::Protocol` for an unreadable line (reading continues)
    /// - `PoolError::ChannelClosed` once the child closed its stdout
    /// - `PoolError::NotStarted` before `start`
    pub async fn get(&mut self) -> Result<WorkResponse, PoolError> {
        let rx = self.outbound.as_mut().ok_or(PoolError::NotStarted)?;
        rx.recv().await.unwrap_or(Err(PoolError::ChannelClosed))
    }

    /// Take the next message if one is already queued.
    ///
    /// # Errors
    ///
    /// `ChannelEmpty` if nothing is queued, otherwise as [`get`](Self::get).
    pub fn get_nowait(&mut self) -> Result<WorkResponse, PoolError> {
        let rx = self.outbound.as_mut().ok_or(PoolError::NotStarted)?;
        match rx.try_recv() {
            Ok(msg) => msg,
            Err(TryRecvError::Empty) => Err(PoolError::ChannelEmpty),
            Err(TryRecvError::Disconnected) => Err(PoolError::ChannelClosed),
        }
    }

    /// Wait for the next result, skipping `Started` notices.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn next_result(&mut self) -> Result<ResultEnvelope, PoolError> {
        loop {
            if let WorkResponse::Result(envelope) = self.get().await? {
                return Ok(envelope);
            }
        }
    }

    /// Check if the child is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Wait for the child to exit.
    ///
    /// # Errors
    ///
    /// See [`ManagedProcess::join`].
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, PoolError> {
        self.process.join(timeout).await
    }

    /// Kill the child.
    ///
    /// # Errors
    ///
    /// See [`ManagedProcess::terminate`].
    pub async fn terminate(&mut self) -> Result<(), PoolError> {
        self.process.terminate().await
    }

    /// Coordinator-assigned id.
    #[must_use]
    pub const fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Configured quota.
    #[must_use]
    pub const fn max_tasks(&self) -> Option<u64> {
        self.max_tasks
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// OS process id, once started.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Exit code, once reaped.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    pub(crate) fn inbound(&self) -> Option<mpsc::UnboundedSender<WorkRequest>> {
        self.process.inbound()
    }
}

async fn read_responses(
    name: String,
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<Result<WorkResponse, PoolError>>,
) {
    let mut reader = LineReader::new(stdout);
    loop {
        match reader.recv::<WorkResponse>().await {
            Ok(Some(msg)) => {
                if tx.send(Ok(msg)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e @ PoolError::Protocol(_)) => {
                warn!(process = %name, error = %e, "Unreadable line from worker");
                if tx.send(Err(e)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(process = %name, error = %e, "Worker stdout failed");
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
    debug!(process = %name, "Worker stdout closed");
}
