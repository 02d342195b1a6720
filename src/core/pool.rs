//! The public pool API.
//!
//! A [`Pool`] keeps `processes` worker children alive, routes jobs to them,
//! and hands back futures for the results. It is cheap to clone; all clones
//! share the same workers. Dropping the last clone without closing kills the
//! workers and fails anything still outstanding.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::core::dispatcher::Dispatcher;
use crate::core::process::ProcessInfo;
use crate::core::protocol::TaskId;
use crate::core::stats::PoolStats;
use crate::core::PoolError;

/// Future resolving to one job's result.
///
/// Dropping the handle does not cancel the job.
#[derive(Debug)]
pub struct TaskHandle<T = Value> {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<Value, PoolError>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TaskHandle<T> {
    /// Pool-assigned job id.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl<T: DeserializeOwned> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => {
                Poll::Ready(serde_json::from_value(value).map_err(Into::into))
            }
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::PoolClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Results of a batch in completion order.
pub struct MapStream<T> {
    inner: FuturesUnordered<TaskHandle<T>>,
}

impl<T: DeserializeOwned> MapStream<T> {
    fn new(handles: Vec<TaskHandle<T>>) -> Self {
        Self {
            inner: handles.into_iter().collect(),
        }
    }

    /// Next result to arrive, or `None` once every job has reported.
    pub async fn recv(&mut self) -> Option<Result<T, PoolError>> {
        self.inner.next().await
    }

    /// Jobs that have not reported yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl<T: DeserializeOwned> Stream for MapStream<T> {
    type Item = Result<T, PoolError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// A pool of worker processes.
///
/// ```no_run
/// # async fn demo() -> Result<(), prometheus_process_pool::PoolError> {
/// use prometheus_process_pool::{Pool, PoolConfig};
///
/// let pool = Pool::start(PoolConfig::new().with_processes(4)).await?;
/// let doubled: Vec<i64> = pool.map("double", [1, 2, 3]).await?;
/// assert_eq!(doubled, vec![2, 4, 6]);
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Dispatcher>,
}

impl Pool {
    /// Spawn the workers.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate, `ProcessStart`
    /// if a worker cannot be spawned.
    pub async fn start(config: PoolConfig) -> Result<Self, PoolError> {
        Ok(Self {
            inner: Arc::new(Dispatcher::start(config)?),
        })
    }

    /// Start a pool, run `body` with it, then close it.
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start).
    pub async fn scoped<F, Fut, R>(config: PoolConfig, body: F) -> Result<R, PoolError>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = R>,
    {
        let pool = Self::start(config).await?;
        let output = body(pool.clone()).await;
        pool.close().await;
        Ok(output)
    }

    /// Queue one job and return a handle to its raw result.
    pub fn submit(
        &self,
        task: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> TaskHandle<Value> {
        self.submit_as(task.into(), args, kwargs)
    }

    fn submit_as<T>(
        &self,
        task: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> TaskHandle<T> {
        let (task_id, rx) = self.inner.submit(task, args, kwargs);
        TaskHandle {
            task_id,
            rx,
            _marker: PhantomData,
        }
    }

    /// Run one job and wait for its result.
    ///
    /// `args` becomes the positional arguments: a tuple or sequence is spread,
    /// `()` means none, and any other value is passed as the only argument.
    ///
    /// # Errors
    ///
    /// - `PoolError::RemoteExecution` if the task failed
    /// - `PoolError::WorkerLost` if its worker died while running it
    /// - `PoolError::Serialization` if arguments or result do not convert
    /// - `PoolError::PoolClosed` if the pool shut down first
    pub async fn apply<T, A>(&self, task: &str, args: A) -> Result<T, PoolError>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        self.apply_with(task, args, Map::new()).await
    }

    /// [`apply`](Self::apply) with keyword arguments.
    ///
    /// # Errors
    ///
    /// As [`apply`](Self::apply).
    pub async fn apply_with<T, A>(
        &self,
        task: &str,
        args: A,
        kwargs: Map<String, Value>,
    ) -> Result<T, PoolError>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        let args = positional(serde_json::to_value(args)?);
        self.submit_as(task.to_string(), args, kwargs).await
    }

    /// Run `task` once per item, each item being the only argument, and
    /// collect results in input order.
    ///
    /// # Errors
    ///
    /// The first failure among the jobs, as [`apply`](Self::apply).
    pub async fn map<T, I>(&self, task: &str, items: I) -> Result<Vec<T>, PoolError>
    where
        T: DeserializeOwned,
        I: IntoIterator,
        I::Item: Serialize,
    {
        let handles = self.submit_each(task, items, |v| Ok(vec![v]))?;
        futures::future::try_join_all(handles).await
    }

    /// Run `task` once per argument tuple, spreading each tuple into
    /// positional arguments, and collect results in input order.
    ///
    /// # Errors
    ///
    /// `PoolError::Serialization` if an item is not a sequence, otherwise as
    /// [`map`](Self::map).
    pub async fn starmap<T, I>(&self, task: &str, arg_tuples: I) -> Result<Vec<T>, PoolError>
    where
        T: DeserializeOwned,
        I: IntoIterator,
        I::Item: Serialize,
    {
        let handles = self.submit_each(task, arg_tuples, |v| match v {
            Value::Array(args) => Ok(args),
            other => Err(PoolError::Serialization(format!(
                "starmap arguments must be sequences, got {other}"
            ))),
        })?;
        futures::future::try_join_all(handles).await
    }

    /// Map `mapper` over `items` and feed the results, in arrival order, to
    /// `reducer` running as its own task.
    ///
    /// # Errors
    ///
    /// `PoolError::Serialization` if an item does not convert,
    /// `PoolError::Internal` if the reducer panics. Job failures are items of
    /// the stream for the reducer to handle.
    pub async fn map_reduce<T, R, I, F, Fut>(
        &self,
        mapper: &str,
        items: I,
        reducer: F,
    ) -> Result<R, PoolError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Send + 'static,
        I: IntoIterator,
        I::Item: Serialize,
        F: FnOnce(MapStream<T>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        let handles = self.submit_each(mapper, items, |v| Ok(vec![v]))?;
        tokio::spawn(reducer(MapStream::new(handles)))
            .await
            .map_err(|e| PoolError::Internal(format!("reducer failed: {e}")))
    }

    /// Convert every item before submitting any, so a bad item submits nothing.
    fn submit_each<T, I>(
        &self,
        task: &str,
        items: I,
        to_args: impl Fn(Value) -> Result<Vec<Value>, PoolError>,
    ) -> Result<Vec<TaskHandle<T>>, PoolError>
    where
        I: IntoIterator,
        I::Item: Serialize,
    {
        let batch = items
            .into_iter()
            .map(|item| to_args(serde_json::to_value(item)?))
            .collect::<Result<Vec<_>, PoolError>>()?;
        Ok(batch
            .into_iter()
            .map(|args| self.submit_as(task.to_string(), args, Map::new()))
            .collect())
    }

    /// Configured number of worker processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.inner.config().processes
    }

    /// Live worker processes.
    #[must_use]
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.inner.processes()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Short id used in this pool's log lines.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        self.inner.pool_id()
    }

    /// Whether `close` or `terminate` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop accepting work and let workers finish what they were sent.
    ///
    /// Jobs still waiting for a worker fail with `PoolClosed`. Workers get
    /// `shutdown_timeout` to finish, then are killed. Every outstanding
    /// handle is resolved when this returns.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Kill every worker now and fail outstanding jobs with `PoolClosed`.
    pub async fn terminate(&self) {
        self.inner.terminate().await;
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pool_id", &self.pool_id())
            .field("processes", &self.process_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Spread sequences, drop unit, wrap anything else.
fn positional(args: Value) -> Vec<Value> {
    match args {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}
