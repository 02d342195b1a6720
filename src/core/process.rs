//! Coordinator-side handle to one child process.
//!
//! A child is the worker program (by default the current executable) re-run
//! with [`CHILD_ENV`] set. Right after spawning, the coordinator writes a
//! [`ChildSpec`] handshake line on the child's stdin telling it what to run;
//! pool workers keep the pipe open for further [`WorkRequest`]s.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::core::protocol::{ChildSpec, JobEnvelope, WireMessage, WorkRequest, CHILD_ENV};
use crate::core::PoolError;
use crate::infra::ipc::LineWriter;

static PROCESS_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_process_name(prefix: &str) -> String {
    format!(
        "{prefix}-process-{}",
        PROCESS_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Lifecycle of a process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// `start` has not been called.
    Unstarted,
    /// The OS process exists and has not been reaped.
    Running,
    /// The process exited and was reaped.
    Exited,
}

/// Introspection snapshot of a pool worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Coordinator-assigned worker id.
    pub worker_id: u64,
    /// Display name.
    pub name: String,
    /// OS process id.
    pub pid: Option<u32>,
    /// Jobs routed to this worker so far.
    pub assigned: u64,
    /// Jobs routed but not yet answered.
    pub outstanding: usize,
}

/// Handle to one OS process running a registered task inside a child runtime.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    spec: ChildSpec,
    config: ProcessConfig,
    capture_stdout: bool,
    state: ProcessState,
    child: Option<Child>,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    stdout: Option<ChildStdout>,
    inbound: Option<mpsc::UnboundedSender<WorkRequest>>,
}

impl ManagedProcess {
    /// Create a process that runs `task` with positional `args` once.
    pub fn new(task: impl Into<String>, args: Vec<Value>) -> Self {
        Self::single_shot(task, args, false)
    }

    pub(crate) fn single_shot(task: impl Into<String>, args: Vec<Value>, capture_stdout: bool) -> Self {
        let config = ProcessConfig::default();
        let spec = ChildSpec::Run {
            name: next_process_name(&config.name_prefix),
            job: JobEnvelope::new(1, task, args),
        };
        Self::from_spec(spec, config, capture_stdout)
    }

    pub(crate) fn from_spec(spec: ChildSpec, config: ProcessConfig, capture_stdout: bool) -> Self {
        Self {
            name: spec.name().to_string(),
            spec,
            config,
            capture_stdout,
            state: ProcessState::Unstarted,
            child: None,
            pid: None,
            exit_status: None,
            stdout: None,
            inbound: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        match &mut self.spec {
            ChildSpec::Run { name: n, .. } | ChildSpec::Pool { name: n, .. } => n.clone_from(&name),
        }
        self.name = name;
        self
    }

    /// Attach keyword arguments to a single-shot target.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        if let ChildSpec::Run { job, .. } = &mut self.spec {
            job.kwargs = kwargs;
        }
        self
    }

    /// Override how the child is launched.
    #[must_use]
    pub fn with_config(mut self, config: ProcessConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the OS process and hand it its target.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `PoolError::AlreadyStarted` on a second call
    /// - `PoolError::ProcessStart` if the program cannot be spawned
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.state != ProcessState::Unstarted {
            return Err(PoolError::AlreadyStarted);
        }

        let program = self.config.resolve_program()?;
        let handshake = self.spec.to_line()?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .env(CHILD_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(if self.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PoolError::ProcessStart(format!("failed to spawn {}: {e}", program.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::ProcessStart("child stdin not captured".into()))?;
        self.stdout = child.stdout.take();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(self.name.clone(), stdin, handshake, rx));
        // Single-shot children only read the handshake; dropping the sender closes stdin.
        if matches!(self.spec, ChildSpec::Pool { .. }) {
            self.inbound = Some(tx);
        }

        self.pid = child.id();
        self.child = Some(child);
        self.state = ProcessState::Running;

        info!(process = %self.name, pid = ?self.pid, "Process started");
        Ok(())
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, once started.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Exit code, once the process has been reaped. `None` if it was killed
    /// by a signal.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|s| s.code())
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_alive(&mut self) -> bool {
        if self.state != ProcessState::Running {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.mark_exited(status);
                false
            }
            Err(e) => {
                warn!(process = %self.name, error = %e, "try_wait failed");
                false
            }
        }
    }

    /// Wait for the process to exit.
    ///
    /// With a timeout, gives up after `timeout` and leaves the process running.
    ///
    /// # Errors
    ///
    /// - `PoolError::NotStarted` if `start` was never called
    /// - `PoolError::Timeout` if the deadline passed first
    /// - `PoolError::Io` if waiting failed
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, PoolError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let child = self.child.as_mut().ok_or(PoolError::NotStarted)?;
        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait())
                .await
                .map_err(|_| PoolError::Timeout)??,
            None => child.wait().await?,
        };
        self.mark_exited(status);
        Ok(status)
    }

    /// Forcibly stop the process and reap it. No-op once exited.
    ///
    /// # Errors
    ///
    /// - `PoolError::NotStarted` if `start` was never called
    /// - `PoolError::Io` if the kill fails
    pub async fn terminate(&mut self) -> Result<(), PoolError> {
        if self.state == ProcessState::Exited {
            return Ok(());
        }
        let child = self.child.as_mut().ok_or(PoolError::NotStarted)?;
        child.kill().await?;
        let status = child.wait().await?;
        self.mark_exited(status);
        debug!(process = %self.name, "Process terminated");
        Ok(())
    }

    pub(crate) fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub(crate) fn inbound(&self) -> Option<mpsc::UnboundedSender<WorkRequest>> {
        self.inbound.clone()
    }

    pub(crate) fn send(&self, request: WorkRequest) -> Result<(), PoolError> {
        match (&self.inbound, self.state) {
            (_, ProcessState::Unstarted) => Err(PoolError::NotStarted),
            (Some(tx), _) => tx.send(request).map_err(|_| PoolError::ChannelClosed),
            (None, _) => Err(PoolError::ChannelClosed),
        }
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.state = ProcessState::Exited;
        self.inbound = None;
        debug!(process = %self.name, pid = ?self.pid, status = %status, "Process exited");
    }
}

/// Write the handshake, then forward requests until the sender is dropped or
/// the child closes its stdin.
async fn write_requests(
    name: String,
    stdin: ChildStdin,
    handshake: String,
    mut rx: mpsc::UnboundedReceiver<WorkRequest>,
) {
    let mut writer = LineWriter::new(stdin);
    if let Err(e) = writer.write_line(&handshake).await {
        warn!(process = %name, error = %e, "Failed to send handshake");
        return;
    }
    while let Some(request) = rx.recv().await {
        if let Err(e) = writer.send(&request).await {
            debug!(process = %name, error = %e, "Child stdin closed, dropping request");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_process_is_unstarted() {
        let mut p = ManagedProcess::new("sleepy", Vec::new()).with_name("test_process");
        assert_eq!(p.name(), "test_process");
        assert_eq!(p.state(), ProcessState::Unstarted);
        assert_eq!(p.pid(), None);
        assert_eq!(p.exit_code(), None);
        assert!(!p.is_alive());
        assert!(matches!(p.spec, ChildSpec::Run { ref name, .. } if name == "test_process"));
    }

    #[test]
    fn test_default_names_are_unique() {
        let a = ManagedProcess::new("t", Vec::new());
        let b = ManagedProcess::new("t", Vec::new());
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("pool-process-"));
    }

    #[tokio::test]
    async fn test_join_before_start() {
        let mut p = ManagedProcess::new("t", Vec::new());
        assert!(matches!(p.join(None).await, Err(PoolError::NotStarted)));
        assert!(matches!(p.terminate().await, Err(PoolError::NotStarted)));
        assert!(matches!(p.send(WorkRequest::Exit), Err(PoolError::NotStarted)));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_process_start() {
        let config = ProcessConfig {
            program: Some("/nonexistent/worker-binary".into()),
            ..ProcessConfig::default()
        };
        let mut p = ManagedProcess::new("t", Vec::new()).with_config(config);
        assert!(matches!(p.start(), Err(PoolError::ProcessStart(_))));
        assert_eq!(p.state(), ProcessState::Unstarted);
    }

    #[tokio::test]
    async fn test_start_twice_and_join_timeout() {
        // `sleep` ignores the handshake line on stdin.
        let config = ProcessConfig {
            program: Some("sleep".into()),
            args: vec!["5".into()],
            ..ProcessConfig::default()
        };
        let mut p = ManagedProcess::new("t", Vec::new()).with_config(config);
        p.start().unwrap();
        assert!(p.pid().is_some());
        assert!(p.is_alive());
        assert!(matches!(p.start(), Err(PoolError::AlreadyStarted)));

        let err = p.join(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout));
        assert!(p.is_alive(), "timeout must not kill the process");

        p.terminate().await.unwrap();
        assert!(!p.is_alive());
        assert_eq!(p.state(), ProcessState::Exited);
    }
}
