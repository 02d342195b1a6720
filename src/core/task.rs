//! Task handlers and the name-based registry used to ship work to children.
//!
//! Closures cannot cross a process boundary, so a job names its task instead.
//! The worker program builds the same `TaskRegistry` in the coordinator and in
//! every child (the child is the same executable), and the child resolves the
//! name back into a handler.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::protocol::Outcome;

/// Error raised by a task handler. Only its kind and message reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Error kind, free-form.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl TaskError {
    /// Create an error with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create an error with the generic `TaskError` kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("TaskError", message)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("TypeError", err.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("Error", format!("{err:#}"))
    }
}

impl From<TaskError> for Outcome {
    fn from(err: TaskError) -> Self {
        Self::Err {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// What a handler returns.
pub type TaskResult = Result<Value, TaskError>;

/// Serialize a handler's return value.
///
/// # Errors
///
/// Returns a `TypeError` task error if the value cannot be represented as JSON.
pub fn ok<T: Serialize>(value: T) -> TaskResult {
    Ok(serde_json::to_value(value)?)
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keyword: Map<String, Value>,
}

impl Args {
    /// Bundle positional and keyword arguments.
    #[must_use]
    pub const fn new(positional: Vec<Value>, keyword: Map<String, Value>) -> Self {
        Self { positional, keyword }
    }

    /// Positional arguments.
    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Keyword arguments.
    #[must_use]
    pub const fn keyword(&self) -> &Map<String, Value> {
        &self.keyword
    }

    /// Number of positional arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Whether there are no positional arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    /// Decode positional argument `index`.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` if the argument is missing or has the wrong shape.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.positional.get(index).ok_or_else(|| {
            TaskError::new("TypeError", format!("missing positional argument {index}"))
        })?;
        Ok(T::deserialize(value)?)
    }

    /// Decode every positional argument as the same type.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` if any argument has the wrong shape.
    pub fn all<T: DeserializeOwned>(&self) -> Result<Vec<T>, TaskError> {
        self.positional
            .iter()
            .map(|v| T::deserialize(v).map_err(TaskError::from))
            .collect()
    }

    /// Decode keyword argument `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` if the argument has the wrong shape.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        self.keyword
            .get(name)
            .map(|v| T::deserialize(v).map_err(TaskError::from))
            .transpose()
    }

    /// Split into positional and keyword parts.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Value>, Map<String, Value>) {
        (self.positional, self.keyword)
    }
}

/// A callable a child process can run.
///
/// Handlers run on the child's single-threaded runtime, so an `await` inside
/// one lets other jobs of the same child make progress when the pool is
/// configured with `child_concurrency > 1`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run the task.
    async fn call(&self, args: Args) -> TaskResult;
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFn<F>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn call(&self, args: Args) -> TaskResult {
        (self.0)(args).await
    }
}

struct BlockingFn<F>(Arc<F>);

#[async_trait]
impl<F> TaskHandler for BlockingFn<F>
where
    F: Fn(Args) -> TaskResult + Send + Sync + 'static,
{
    async fn call(&self, args: Args) -> TaskResult {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f(args))
            .await
            .map_err(|e| TaskError::new("Panic", e.to_string()))?
    }
}

/// Name → handler table.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register_handler(name, Arc::new(AsyncFn(f)))
    }

    /// Register a blocking function; it runs on the child's blocking thread pool.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Args) -> TaskResult + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(BlockingFn(Arc::new(f))))
    }

    /// Register a handler object.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_task<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register(name, f);
        self
    }

    /// Builder form of [`register_blocking`](Self::register_blocking).
    #[must_use]
    pub fn with_blocking_task<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> TaskResult + Send + Sync + 'static,
    {
        self.register_blocking(name, f);
        self
    }

    /// Look up a handler.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check if a handler exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `name` with `args` and capture the outcome. Unknown names fail with
    /// kind `UnknownTask`.
    pub async fn invoke(&self, name: &str, args: Args) -> Outcome {
        let Some(handler) = self.get(name) else {
            return Outcome::failure("UnknownTask", format!("no task registered as `{name}`"));
        };
        match handler.call(args).await {
            Ok(value) => Outcome::Ok { value },
            Err(err) => err.into(),
        }
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
