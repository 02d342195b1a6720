//! Process handles, the wire protocol, task dispatch, and the pool itself.

pub mod error;
pub mod pool;
pub mod pool_worker;
pub mod process;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod task_worker;

mod dispatcher;

pub use error::{AppResult, PoolError};
pub use pool::{MapStream, Pool, TaskHandle};
pub use pool_worker::{PoolWorker, WorkerOptions};
pub use process::{ManagedProcess, ProcessInfo, ProcessState};
pub use protocol::{JobEnvelope, Outcome, ResultEnvelope, TaskId};
pub use scheduler::{LeastOutstanding, RoundRobin, Scheduler, WorkerLoad};
pub use stats::PoolStats;
pub use task::{ok, Args, TaskError, TaskHandler, TaskRegistry, TaskResult};
pub use task_worker::TaskWorker;
