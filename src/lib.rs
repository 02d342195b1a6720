//! # Prometheus Process Pool
//!
//! A pool of OS worker processes driven from async Rust.
//!
//! Work that must not share an address space with the caller, or that needs
//! more CPU than one process can give, runs in child processes. Each child
//! owns a single-threaded tokio runtime for its whole life and runs jobs on
//! it; the coordinator routes jobs, correlates results, and replaces children
//! that retire or die.
//!
//! ## Key Features
//!
//! - **Named tasks**: jobs reference a task by name in a [`TaskRegistry`]
//!   built identically in the coordinator binary and every child
//! - **Worker recycling**: `max_tasks_per_child` retires a child after a quota
//!   and the pool spawns a fresh one
//! - **Failure isolation**: task errors and panics come back as
//!   [`PoolError::RemoteExecution`]; a child that dies mid-job fails only
//!   that job with [`PoolError::WorkerLost`]
//! - **Batch helpers**: `map`, `starmap`, and `map_reduce` on [`Pool`]
//!
//! ## Worker program
//!
//! Children are the current executable re-run with `PROCESS_POOL_CHILD=1`.
//! The binary must call [`run_if_child`] before anything else in `main`:
//!
//! ```rust,no_run
//! use prometheus_process_pool::{ok, run_if_child, Pool, PoolConfig, TaskRegistry};
//!
//! fn registry() -> TaskRegistry {
//!     TaskRegistry::new().with_task("square", |args| async move {
//!         let v: i64 = args.arg(0)?;
//!         ok(v * v)
//!     })
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_if_child(registry);
//!
//!     let rt = tokio::runtime::Runtime::new()?;
//!     rt.block_on(async {
//!         let pool = Pool::start(PoolConfig::new().with_processes(2)).await?;
//!         let squares: Vec<i64> = pool.map("square", 1..=10).await?;
//!         println!("{squares:?}");
//!         pool.close().await;
//!         Ok::<(), anyhow::Error>(())
//!     })
//! }
//! ```
//!
//! Child stdout carries the IPC protocol. Tasks must not print to stdout;
//! [`init_tracing`] logs to stderr.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Process handles, the wire protocol, task dispatch, and the pool itself.
pub mod core;
/// Configuration models for pools and child processes.
pub mod config;
/// Builders to construct pools from configuration.
pub mod builders;
/// Infrastructure adapters for pipes and line framing.
pub mod infra;
/// The child-process side.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use builders::build_pools;
pub use config::{PoolConfig, PoolsConfig, ProcessConfig, SchedulerKind, TaskSpec};
pub use crate::core::{
    ok, Args, ManagedProcess, MapStream, Pool, PoolError, PoolStats, PoolWorker, ProcessInfo,
    ProcessState, TaskError, TaskHandle, TaskHandler, TaskRegistry, TaskResult, TaskWorker,
    WorkerOptions,
};
pub use runtime::{run_if_child, ChildRuntime};
pub use util::init_tracing;
