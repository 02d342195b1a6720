//! The child side: what a spawned worker process runs.
//!
//! A child owns one single-threaded tokio runtime for its whole life. It reads
//! a [`ChildSpec`] handshake from stdin, then either runs one job and exits or
//! serves jobs until its quota is used up, it is asked to exit, or stdin closes.

use std::any::Any;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::protocol::{
    ChildSpec, JobEnvelope, Outcome, ResultEnvelope, WorkRequest, WorkResponse, CHILD_ENV,
};
use crate::core::task::{Args, TaskRegistry};
use crate::core::{AppResult, PoolError};
use crate::infra::ipc::{LineReader, LineWriter};
use crate::util::init_tracing;

/// The job ran and returned a value, or the pool worker finished normally.
pub const EXIT_OK: i32 = 0;
/// A single-shot job failed.
pub const EXIT_TASK_FAILED: i32 = 1;
/// The child could not talk to the coordinator.
pub const EXIT_RUNTIME_ERROR: i32 = 2;
/// The pool initializer failed; the child served nothing.
pub const EXIT_INIT_FAILED: i32 = 3;

/// Become a worker if this process was spawned as one.
///
/// Call this first thing in `main`, before any tokio runtime exists. In the
/// coordinator it returns immediately. In a child it serves the coordinator
/// and exits the process.
///
/// ```no_run
/// use prometheus_process_pool::{ok, run_if_child, TaskRegistry};
///
/// fn registry() -> TaskRegistry {
///     TaskRegistry::new().with_task("double", |args| async move {
///         let v: i64 = args.arg(0)?;
///         ok(v * 2)
///     })
/// }
///
/// fn main() {
///     run_if_child(registry);
///     // coordinator code
/// }
/// ```
pub fn run_if_child<F>(build_registry: F)
where
    F: FnOnce() -> TaskRegistry,
{
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    init_tracing();

    let runtime = match ChildRuntime::new(build_registry()) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to start child runtime");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };
    let code = runtime.serve_stdio().unwrap_or_else(|e| {
        error!(error = %format!("{e:#}"), "Child runtime failed");
        EXIT_RUNTIME_ERROR
    });
    // Exit with the runtime still alive: a pending blocking stdin read would
    // stall its shutdown.
    std::process::exit(code);
}

/// A child's event loop: one current-thread runtime plus the task table.
pub struct ChildRuntime {
    runtime: tokio::runtime::Runtime,
    registry: Arc<TaskRegistry>,
}

impl ChildRuntime {
    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Fails if the tokio runtime cannot be created.
    pub fn new(registry: TaskRegistry) -> AppResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build child runtime")?;
        Ok(Self {
            runtime,
            registry: Arc::new(registry),
        })
    }

    /// Run one job to completion on this runtime.
    pub fn run_job(&self, job: JobEnvelope) -> ResultEnvelope {
        self.runtime
            .block_on(execute(Arc::clone(&self.registry), job))
    }

    /// Serve the coordinator over this process's stdin and stdout.
    ///
    /// # Errors
    ///
    /// See [`serve`].
    pub fn serve_stdio(&self) -> AppResult<i32> {
        self.runtime.block_on(serve(
            Arc::clone(&self.registry),
            tokio::io::stdin(),
            tokio::io::stdout(),
        ))
    }
}

/// Serve one handshake's worth of work from `input`, answering on `output`.
///
/// Returns the exit code the process should use.
///
/// # Errors
///
/// Fails if the handshake is missing or unreadable, or if either pipe breaks.
pub async fn serve<R, W>(registry: Arc<TaskRegistry>, input: R, output: W) -> AppResult<i32>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = LineReader::new(input);
    let mut writer = LineWriter::new(output);

    let Some(spec) = reader
        .recv::<ChildSpec>()
        .await
        .context("failed to read child handshake")?
    else {
        bail!("stdin closed before the handshake");
    };

    match spec {
        ChildSpec::Run { name, job } => {
            debug!(process = %name, task = %job.task, "Running single job");
            let envelope = execute(registry, job).await;
            let code = if envelope.outcome.is_ok() {
                EXIT_OK
            } else {
                EXIT_TASK_FAILED
            };
            writer.send(&envelope).await?;
            Ok(code)
        }
        ChildSpec::Pool {
            name,
            worker_id,
            max_tasks,
            concurrency,
            initializer,
        } => {
            if let Some(job) = initializer {
                let envelope = execute(Arc::clone(&registry), job).await;
                if let Outcome::Err { kind, message } = envelope.outcome {
                    error!(worker_id, %kind, %message, "Initializer failed");
                    return Ok(EXIT_INIT_FAILED);
                }
            }
            info!(process = %name, worker_id, ?max_tasks, concurrency, "Worker serving");
            serve_pool(&registry, &mut reader, &mut writer, max_tasks, concurrency.max(1)).await?;
            Ok(EXIT_OK)
        }
    }
}

async fn serve_pool<R, W>(
    registry: &Arc<TaskRegistry>,
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    max_tasks: Option<u64>,
    concurrency: usize,
) -> AppResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut running = JoinSet::new();
    let mut accepted: u64 = 0;
    let mut input_open = true;

    loop {
        let under_quota = max_tasks.is_none_or(|quota| accepted < quota);
        let can_accept = input_open && under_quota && running.len() < concurrency;
        if !can_accept && running.is_empty() {
            break;
        }

        tokio::select! {
            request = reader.recv::<WorkRequest>(), if can_accept => match request {
                Ok(Some(WorkRequest::Job(job))) => {
                    accepted += 1;
                    writer.send(&WorkResponse::Started { task_id: job.task_id }).await?;
                    running.spawn(execute(Arc::clone(registry), job));
                }
                Ok(Some(WorkRequest::Exit)) => {
                    debug!("Exit requested");
                    input_open = false;
                }
                Ok(None) => {
                    debug!("Coordinator closed stdin");
                    input_open = false;
                }
                Err(PoolError::Protocol(msg)) => warn!(error = %msg, "Skipping malformed request"),
                Err(e) => return Err(e).context("failed to read request"),
            },
            Some(done) = running.join_next(), if !running.is_empty() => {
                let envelope = done.context("job executor failed")?;
                writer.send(&WorkResponse::Result(envelope)).await?;
            }
        }
    }

    debug!(accepted, "Worker done");
    Ok(())
}

/// Run a job, turning handler errors and panics into failure outcomes.
async fn execute(registry: Arc<TaskRegistry>, job: JobEnvelope) -> ResultEnvelope {
    let JobEnvelope {
        task_id,
        task,
        args,
        kwargs,
    } = job;
    debug!(task_id, task = %task, "Executing job");

    let handle =
        tokio::spawn(async move { registry.invoke(&task, Args::new(args, kwargs)).await });
    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Outcome::failure("Panic", panic_message(&*e.into_panic())),
        Err(e) => Outcome::failure("Cancelled", e.to_string()),
    };
    ResultEnvelope { task_id, outcome }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
