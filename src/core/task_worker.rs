//! One-shot worker process: run a single task, hand back its value.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::process::ChildStdout;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ProcessConfig;
use crate::core::process::{ManagedProcess, ProcessState};
use crate::core::protocol::{Outcome, ResultEnvelope};
use crate::core::PoolError;
use crate::infra::ipc::LineReader;

/// Task id of the only job a task worker runs.
const TASK_ID: u64 = 1;

#[derive(Debug)]
enum Completion {
    Finished(Outcome),
    Lost,
    Protocol(String),
}

/// A process that runs exactly one registered task.
///
/// ```no_run
/// # async fn demo() -> Result<(), prometheus_process_pool::PoolError> {
/// use prometheus_process_pool::TaskWorker;
///
/// let value = TaskWorker::new("double", vec![serde_json::json!(21)]).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TaskWorker {
    process: ManagedProcess,
    reply: Option<oneshot::Receiver<Completion>>,
    completion: Option<Completion>,
}

impl TaskWorker {
    /// Create a worker for `task` with positional `args`.
    pub fn new(task: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            process: ManagedProcess::single_shot(task, args, true),
            reply: None,
            completion: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.process = self.process.with_name(name);
        self
    }

    /// Attach keyword arguments.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.process = self.process.with_kwargs(kwargs);
        self
    }

    /// Override how the child is launched.
    #[must_use]
    pub fn with_config(mut self, config: ProcessConfig) -> Self {
        self.process = self.process.with_config(config);
        self
    }

    /// Spawn the process and start collecting its result.
    ///
    /// # Errors
    ///
    /// See [`ManagedProcess::start`].
    pub fn start(&mut self) -> Result<(), PoolError> {
        self.process.start()?;
        let stdout = self
            .process
            .take_stdout()
            .ok_or_else(|| PoolError::Internal("task worker stdout not captured".into()))?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(read_result(self.process.name().to_string(), stdout, tx));
        self.reply = Some(rx);
        Ok(())
    }

    /// Wait for the task's value.
    ///
    /// # Errors
    ///
    /// - `PoolError::Timeout` if `timeout` passed first (the process keeps running)
    /// - `PoolError::RemoteExecution` if the task failed
    /// - `PoolError::WorkerLost` if the process exited without a result
    /// - `PoolError::Protocol` if the child wrote something unreadable
    /// - `PoolError::NotStarted` if `start` was never called
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<Value, PoolError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        if self.completion.is_none() {
            let rx = self.reply.as_mut().ok_or(PoolError::NotStarted)?;
            let received = match timeout {
                Some(limit) => tokio::time::timeout(limit, rx)
                    .await
                    .map_err(|_| PoolError::Timeout)?,
                None => rx.await,
            };
            self.reply = None;
            self.completion = Some(received.unwrap_or(Completion::Lost));
        }
        // The child exits right after writing its result; reaping shares the
        // caller's deadline and is retried by the next join if it runs out.
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.process.join(remaining).await?;

        match &self.completion {
            Some(Completion::Finished(outcome)) => outcome.clone().into_result(),
            Some(Completion::Protocol(msg)) => Err(PoolError::Protocol(msg.clone())),
            Some(Completion::Lost) | None => Err(PoolError::WorkerLost { task_id: TASK_ID }),
        }
    }

    /// The task's value, once it completed successfully.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match &self.completion {
            Some(Completion::Finished(Outcome::Ok { value })) => Some(value),
            _ => None,
        }
    }

    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Forcibly stop the process.
    ///
    /// # Errors
    ///
    /// See [`ManagedProcess::terminate`].
    pub async fn terminate(&mut self) -> Result<(), PoolError> {
        self.process.terminate().await
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

    async fn run(&mut self) -> Result<Value, PoolError> {
        if self.process.state() == ProcessState::Unstarted {
            self.start()?;
        }
        self.join(None).await
    }
}

impl<'a> IntoFuture for &'a mut TaskWorker {
    type Output = Result<Value, PoolError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

impl IntoFuture for TaskWorker {
    type Output = Result<Value, PoolError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.run().await })
    }
}

async fn read_result(name: String, stdout: ChildStdout, tx: oneshot::Sender<Completion>) {
    let mut reader = LineReader::new(stdout);
    let completion = match reader.recv::<ResultEnvelope>().await {
        Ok(Some(envelope)) if envelope.task_id == TASK_ID => Completion::Finished(envelope.outcome),
        Ok(Some(envelope)) => Completion::Protocol(format!(
            "unexpected task id {} from {name}",
            envelope.task_id
        )),
        Ok(None) => Completion::Lost,
        Err(PoolError::Protocol(msg)) => {
            warn!(process = %name, error = %msg, "Unreadable result line");
            Completion::Protocol(msg)
        }
        Err(e) => {
            warn!(process = %name, error = %e, "Failed to read result");
            Completion::Lost
        }
    };
    debug!(process = %name, ?completion, "Task worker finished");
    let _ = tx.send(completion);
}
