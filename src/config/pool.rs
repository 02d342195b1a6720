//! Pool, process, and multi-pool configuration structures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::PoolError;

/// Prefix of every environment variable read by [`PoolConfig::from_env`].
pub const ENV_PREFIX: &str = "PROCESS_POOL_";

/// Routing policy used by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Rotate through live workers.
    #[default]
    RoundRobin,
    /// Pick the worker with the fewest unfinished jobs.
    LeastOutstanding,
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_outstanding" => Ok(Self::LeastOutstanding),
            other => Err(format!("unknown scheduler `{other}`")),
        }
    }
}

/// A task reference plus arguments, used for per-child initializers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Registered task name.
    pub task: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// How child processes are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Worker program; the current executable when unset.
    pub program: Option<PathBuf>,
    /// Extra command-line arguments for the worker program.
    pub args: Vec<String>,
    /// Prefix for process display names.
    pub name_prefix: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            name_prefix: "pool".into(),
        }
    }
}

impl ProcessConfig {
    /// Resolve the program to execute.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ProcessStart` if no program is configured and the
    /// current executable cannot be determined.
    pub fn resolve_program(&self) -> Result<PathBuf, PoolError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| {
                PoolError::ProcessStart(format!("failed to get current executable: {e}"))
            }),
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes kept alive.
    pub processes: usize,
    /// Jobs a worker runs before it is recycled; unbounded when unset.
    pub max_tasks_per_child: Option<u64>,
    /// Jobs one child may run concurrently on its runtime.
    pub child_concurrency: usize,
    /// Routing policy.
    pub scheduler: SchedulerKind,
    /// How long `close` waits for workers before killing them (milliseconds).
    pub shutdown_timeout_ms: u64,
    /// Abnormal exits in a row, without any completed job, before respawning stops.
    pub max_consecutive_crashes: u32,
    /// Task run once in every child before it serves jobs.
    pub initializer: Option<TaskSpec>,
    /// Child launch settings.
    pub process: ProcessConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: num_cpus::get(),
            max_tasks_per_child: None,
            child_concurrency: 1,
            scheduler: SchedulerKind::default(),
            shutdown_timeout_ms: 5_000,
            max_consecutive_crashes: 5,
            initializer: None,
            process: ProcessConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Default configuration: one worker per CPU, unbounded quota.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker processes.
    #[must_use]
    pub const fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    /// Recycle each worker after `max_tasks` jobs.
    #[must_use]
    pub const fn with_max_tasks_per_child(mut self, max_tasks: u64) -> Self {
        self.max_tasks_per_child = Some(max_tasks);
        self
    }

    /// Let each child run up to `concurrency` jobs at once.
    #[must_use]
    pub const fn with_child_concurrency(mut self, concurrency: usize) -> Self {
        self.child_concurrency = concurrency;
        self
    }

    /// Choose the routing policy.
    #[must_use]
    pub const fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the graceful shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the crash-loop threshold.
    #[must_use]
    pub const fn with_max_consecutive_crashes(mut self, crashes: u32) -> Self {
        self.max_consecutive_crashes = crashes;
        self
    }

    /// Run `task` once in every child before it serves jobs.
    #[must_use]
    pub fn with_initializer(mut self, task: impl Into<String>, args: Vec<Value>) -> Self {
        self.initializer = Some(TaskSpec {
            task: task.into(),
            args,
            kwargs: Map::new(),
        });
        self
    }

    /// Launch `program` instead of the current executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.process.program = Some(program.into());
        self
    }

    /// Extra arguments for the worker program.
    #[must_use]
    pub fn with_child_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Prefix for process display names.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.process.name_prefix = prefix.into();
        self
    }

    /// Graceful shutdown timeout as a `Duration`.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.processes == 0 {
            return Err("processes must be greater than 0".into());
        }
        if self.max_tasks_per_child == Some(0) {
            return Err("max_tasks_per_child must be greater than 0 when set".into());
        }
        if self.child_concurrency == 0 {
            return Err("child_concurrency must be greater than 0".into());
        }
        if self.shutdown_timeout_ms == 0 {
            return Err("shutdown_timeout_ms must be greater than 0".into());
        }
        if self.max_consecutive_crashes == 0 {
            return Err("max_consecutive_crashes must be greater than 0".into());
        }
        if self.process.name_prefix.trim().is_empty() {
            return Err("process.name_prefix must not be empty".into());
        }
        if let Some(init) = &self.initializer {
            if init.task.is_empty() {
                return Err("initializer task name must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse pool configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `PROCESS_POOL_*` environment variables, after
    /// loading a `.env` file if one exists.
    ///
    /// # Errors
    ///
    /// Returns a description of the first variable that fails to parse, or of
    /// a validation failure.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup, applying values
    /// on top of the defaults.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = var("PROCESSES") {
            config.processes = parse_var("PROCESSES", &v)?;
        }
        if let Some(v) = var("MAX_TASKS_PER_CHILD") {
            config.max_tasks_per_child = Some(parse_var("MAX_TASKS_PER_CHILD", &v)?);
        }
        if let Some(v) = var("CHILD_CONCURRENCY") {
            config.child_concurrency = parse_var("CHILD_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("SCHEDULER") {
            config.scheduler = v.parse()?;
        }
        if let Some(v) = var("SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = parse_var("SHUTDOWN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("MAX_CONSECUTIVE_CRASHES") {
            config.max_consecutive_crashes = parse_var("MAX_CONSECUTIVE_CRASHES", &v)?;
        }
        if let Some(v) = var("PROGRAM") {
            config.process.program = Some(PathBuf::from(v));
        }
        if let Some(v) = var("NAME_PREFIX") {
            config.process.name_prefix = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{name}: {e}"))
}

/// Several named pools, built together by [`crate::builders::build_pools`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Map of pool name to configuration.
    pub pools: HashMap<String, PoolConfig>,
}

impl PoolsConfig {
    /// Validate all pools and ensure at least one pool exists.
    ///
    /// # Errors
    ///
    /// Returns a description naming the first invalid pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be defined".into());
        }
        for (name, pool) in &self.pools {
            pool.validate()
                .map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse multi-pool configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PoolConfig::new();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.processes, num_cpus::get());
        assert_eq!(cfg.child_concurrency, 1);
        assert_eq!(cfg.max_tasks_per_child, None);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_builder_methods() {
        let cfg = PoolConfig::new()
            .with_processes(3)
            .with_max_tasks_per_child(10)
            .with_child_concurrency(2)
            .with_scheduler(SchedulerKind::LeastOutstanding)
            .with_shutdown_timeout(Duration::from_millis(250))
            .with_name_prefix("ingest");
        assert_eq!(cfg.processes, 3);
        assert_eq!(cfg.max_tasks_per_child, Some(10));
        assert_eq!(cfg.child_concurrency, 2);
        assert_eq!(cfg.scheduler, SchedulerKind::LeastOutstanding);
        assert_eq!(cfg.shutdown_timeout_ms, 250);
        assert_eq!(cfg.process.name_prefix, "ingest");
    }

    #[test]
    fn test_zero_quota_rejected() {
        let cfg = PoolConfig::new().with_max_tasks_per_child(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = PoolConfig::from_json_str(r#"{"processes": 2, "scheduler": "least_outstanding"}"#)
            .unwrap();
        assert_eq!(cfg.processes, 2);
        assert_eq!(cfg.scheduler, SchedulerKind::LeastOutstanding);
        assert_eq!(cfg.child_concurrency, 1);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("PROCESS_POOL_PROCESSES", "4"),
            ("PROCESS_POOL_MAX_TASKS_PER_CHILD", "100"),
            ("PROCESS_POOL_SCHEDULER", "least-outstanding"),
        ]
        .into_iter()
        .collect();
        let cfg = PoolConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.processes, 4);
        assert_eq!(cfg.max_tasks_per_child, Some(100));
        assert_eq!(cfg.scheduler, SchedulerKind::LeastOutstanding);
    }

    #[test]
    fn test_from_lookup_bad_number() {
        let err = PoolConfig::from_lookup(|k| {
            (k == "PROCESS_POOL_PROCESSES").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.starts_with("PROCESS_POOL_PROCESSES"));
    }

    #[test]
    fn test_explicit_program_resolves() {
        let cfg = ProcessConfig {
            program: Some(PathBuf::from("/usr/bin/worker")),
            ..ProcessConfig::default()
        };
        assert_eq!(cfg.resolve_program().unwrap(), PathBuf::from("/usr/bin/worker"));
    }
}
