//! Configuration models for pools, child processes, and routing.

pub mod pool;

pub use pool::{PoolConfig, PoolsConfig, ProcessConfig, SchedulerKind, TaskSpec, ENV_PREFIX};
