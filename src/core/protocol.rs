//! Wire protocol between the coordinator and its child processes.
//!
//! Every message is one JSON object on its own line. The coordinator writes to
//! the child's stdin; the child answers on its stdout.
//!
//! ```text
//! coordinator                              child
//!     │ ── ChildSpec (handshake) ──────────▶ │
//!     │ ── WorkRequest::Job ───────────────▶ │
//!     │ ◀──────────── WorkResponse::Started ─ │
//!     │ ◀───────────── WorkResponse::Result ─ │
//!     │ ── WorkRequest::Exit ──────────────▶ │
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::PoolError;

/// Pool-unique job identifier.
pub type TaskId = u64;

/// Environment variable set on every spawned child.
pub const CHILD_ENV: &str = "PROCESS_POOL_CHILD";

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Identifier echoed back in the result envelope.
    pub task_id: TaskId,
    /// Registered task name.
    pub task: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl JobEnvelope {
    /// Create a job with positional arguments only.
    pub fn new(task_id: TaskId, task: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            task_id,
            task: task.into(),
            args,
            kwargs: Map::new(),
        }
    }

    /// Attach keyword arguments.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// Result of running one job: a value or a captured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The task returned a value.
    Ok {
        /// Returned value.
        value: Value,
    },
    /// The task failed; only kind and message cross the process boundary.
    Err {
        /// Error kind, e.g. `UnknownTask` or `Panic`.
        kind: String,
        /// Human-readable description.
        message: String,
    },
}

impl Outcome {
    /// Build a failure outcome.
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Err {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Whether the task succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Convert into the caller-facing result.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::RemoteExecution` for failure outcomes.
    pub fn into_result(self) -> Result<Value, PoolError> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { kind, message } => Err(PoolError::RemoteExecution { kind, message }),
        }
    }
}

/// The response to exactly one job envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Job this result answers.
    pub task_id: TaskId,
    /// What happened.
    pub outcome: Outcome,
}

/// Handshake line telling a freshly spawned child what to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChildSpec {
    /// Run one job, write its result, exit.
    Run {
        /// Display name of the process.
        name: String,
        /// The job to run.
        job: JobEnvelope,
    },
    /// Serve jobs from stdin until the quota is used up.
    Pool {
        /// Display name of the process.
        name: String,
        /// Coordinator-assigned worker id.
        worker_id: u64,
        /// Jobs to complete before retiring; `None` is unbounded.
        max_tasks: Option<u64>,
        /// Jobs allowed to run at once inside the child.
        concurrency: usize,
        /// Job run once before serving.
        initializer: Option<JobEnvelope>,
    },
}

impl ChildSpec {
    /// Display name of the process.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Run { name, .. } | Self::Pool { name, .. } => name,
        }
    }
}

/// Request from coordinator to a pool worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Run a job.
    Job(JobEnvelope),
    /// Finish queued work and exit.
    Exit,
}

/// Message from a child back to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// The child picked the job up and is running it.
    Started {
        /// Job being run.
        task_id: TaskId,
    },
    /// The job finished.
    Result(ResultEnvelope),
}

/// Line-delimited JSON encoding shared by every wire message.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Serialize to a JSON line (with trailing newline).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Serialization` if a value cannot be encoded.
    fn to_line(&self) -> Result<String, PoolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Protocol` if the line is not a valid message.
    fn from_line(line: &str) -> Result<Self, PoolError> {
        serde_json::from_str(line.trim())
            .map_err(|e| PoolError::Protocol(format!("malformed message: {e}")))
    }
}

impl WireMessage for ChildSpec {}
impl WireMessage for WorkRequest {}
impl WireMessage for WorkResponse {}
impl WireMessage for ResultEnvelope {}
