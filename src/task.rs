use crate::broker::{Broker, BrokerError, RedisBroker};
use crate::codec::{CodecError, Serializer};
use crate::error::{PoolError, UnitError};
use crate::pool::BoundedPool;
use crate::queue::WorkUnit;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, info, warn};

/// Errors from the distributed task layer.
#[derive(Debug, Error)]
pub enum TaskError {
  #[error("broker operation failed: {0}")]
  Broker(#[from] BrokerError),

  #[error("failed to encode call record: {0}")]
  Encode(#[source] CodecError),

  #[error("failed to decode payload: {0}")]
  Decode(#[source] CodecError),

  #[error("local pool rejected work: {0}")]
  Pool(#[from] PoolError),
}

fn default_max_concurrency() -> usize {
  50
}

fn default_broker_url() -> String {
  "redis://127.0.0.1:6379/0".to_string()
}

fn default_poll_timeout_secs() -> u64 {
  5
}

/// Per-task configuration: which broker queue the task lives on and how
/// its consumer-side pool is sized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
  /// Broker key this task's queue lives under.
  pub queue_name: String,

  /// Size of the local consumer pool.
  #[serde(default = "default_max_concurrency")]
  pub max_concurrency: usize,

  /// Local staging-queue capacity. Defaults to ten times the
  /// concurrency when unset.
  #[serde(default)]
  pub max_queue_size: Option<usize>,

  /// Connection string for the broker.
  #[serde(default = "default_broker_url")]
  pub broker_url: String,

  /// Payload wire format.
  #[serde(default)]
  pub serializer: Serializer,

  /// How long a single broker poll waits before the consume loop
  /// rechecks its stop flag.
  #[serde(default = "default_poll_timeout_secs")]
  pub poll_timeout_secs: u64,
}

impl TaskConfig {
  pub fn new(queue_name: impl Into<String>) -> Self {
    Self {
      queue_name: queue_name.into(),
      max_concurrency: default_max_concurrency(),
      max_queue_size: None,
      broker_url: default_broker_url(),
      serializer: Serializer::default(),
      poll_timeout_secs: default_poll_timeout_secs(),
    }
  }

  pub fn effective_queue_size(&self) -> usize {
    self.max_queue_size.unwrap_or(self.max_concurrency * 10)
  }

  pub fn poll_timeout(&self) -> Duration {
    Duration::from_secs(self.poll_timeout_secs)
  }
}

type TaskHandler<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<R, UnitError>> + Send + Sync>;

/// Builder binding a handler function to a named broker queue.
///
/// ```no_run
/// # use futures_sluice::{TaskBuilder, Serializer, UnitError};
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let add = TaskBuilder::new("q1")
///   .max_concurrency(3)
///   .serializer(Serializer::Structured)
///   .connect(|(a, b): (i64, i64)| async move { Ok::<_, UnitError>(a + b) })
///   .await?;
///
/// add.submit((1, 2)).await?;   // producer side
/// add.consume().await?;        // consumer side, runs until stop()
/// # Ok(())
/// # }
/// ```
pub struct TaskBuilder {
  config: TaskConfig,
}

impl TaskBuilder {
  pub fn new(queue_name: impl Into<String>) -> Self {
    Self { config: TaskConfig::new(queue_name) }
  }

  pub fn from_config(config: TaskConfig) -> Self {
    Self { config }
  }

  pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
    self.config.max_concurrency = max_concurrency;
    self
  }

  pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
    self.config.max_queue_size = Some(max_queue_size);
    self
  }

  pub fn broker_url(mut self, broker_url: impl Into<String>) -> Self {
    self.config.broker_url = broker_url.into();
    self
  }

  pub fn serializer(mut self, serializer: Serializer) -> Self {
    self.config.serializer = serializer;
    self
  }

  pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
    self.config.poll_timeout_secs = poll_timeout.as_secs().max(1);
    self
  }

  /// Connects a Redis broker at the configured URL and binds `handler`.
  pub async fn connect<A, R, F, Fut>(self, handler: F) -> Result<NamedTask<A, R>, TaskError>
  where
    A: Serialize + DeserializeOwned + Send + 'static,
    R: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, UnitError>> + Send + 'static,
  {
    let broker = RedisBroker::connect(&self.config.broker_url).await?;
    Ok(self.bind(Arc::new(broker), handler))
  }

  /// Binds `handler` against a caller-supplied broker.
  pub fn bind<A, R, F, Fut>(self, broker: Arc<dyn Broker>, handler: F) -> NamedTask<A, R>
  where
    A: Serialize + DeserializeOwned + Send + 'static,
    R: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, UnitError>> + Send + 'static,
  {
    NamedTask {
      config: self.config,
      handler: Arc::new(move |args: A| handler(args).boxed()),
      broker,
      consuming: AtomicBool::new(false),
    }
  }
}

/// A user function bound to a broker queue.
///
/// Producers `submit` serialized call records; consumers run `consume`,
/// which feeds popped records into a locally owned [`BoundedPool`] so
/// the broker is never drained faster than the pool can execute.
/// `call` bypasses the queue entirely.
pub struct NamedTask<A, R>
where
  A: Serialize + DeserializeOwned + Send + 'static,
  R: Send + 'static,
{
  config: TaskConfig,
  handler: TaskHandler<A, R>,
  broker: Arc<dyn Broker>,
  consuming: AtomicBool,
}

impl<A, R> NamedTask<A, R>
where
  A: Serialize + DeserializeOwned + Send + 'static,
  R: Send + 'static,
{
  pub fn queue_name(&self) -> &str {
    &self.config.queue_name
  }

  pub fn config(&self) -> &TaskConfig {
    &self.config
  }

  /// Runs the bound function directly, without touching the broker.
  pub async fn call(&self, args: A) -> Result<R, UnitError> {
    (self.handler)(args).await
  }

  /// Serializes `args` and appends the record to the broker queue.
  /// Returns once the push has been acknowledged; the result of the
  /// eventual execution is not delivered back.
  pub async fn submit(&self, args: A) -> Result<(), TaskError> {
    let payload = self.config.serializer.encode(&args).map_err(TaskError::Encode)?;
    self.broker.push(&self.config.queue_name, payload).await?;
    debug!(queue = %self.config.queue_name, "Call record pushed to broker.");
    Ok(())
  }

  /// Consumes the broker queue until [`stop`](Self::stop) is called.
  ///
  /// Each popped payload is decoded and submitted (blocking) into a
  /// local pool of `max_concurrency` workers; the blocking submit is
  /// what keeps the loop from pulling the broker into local memory
  /// faster than the handlers drain it. Handler failures are logged per
  /// unit and never kill the loop; undecodable payloads are logged and
  /// skipped. Broker failures terminate the loop and surface to the
  /// caller. On every exit path the local pool is fully drained first.
  pub async fn consume(&self) -> Result<(), TaskError> {
    self.consume_with_timeout(self.config.poll_timeout()).await
  }

  /// [`consume`](Self::consume) with an explicit broker poll timeout.
  pub async fn consume_with_timeout(&self, poll_timeout: Duration) -> Result<(), TaskError> {
    if self.consuming.swap(true, AtomicOrdering::SeqCst) {
      warn!(queue = %self.config.queue_name, "Consumer already running for this queue.");
      return Ok(());
    }

    let pool = BoundedPool::<()>::new(
      self.config.max_concurrency,
      self.config.effective_queue_size(),
      TokioHandle::current(),
      &format!("consumer:{}", self.config.queue_name),
    );
    info!(
      queue = %self.config.queue_name,
      max_concurrency = self.config.max_concurrency,
      "Consumer started."
    );

    let outcome = self.consume_loop(&pool, poll_timeout).await;

    pool.shutdown(true).await;
    self.consuming.store(false, AtomicOrdering::SeqCst);
    match &outcome {
      Ok(()) => info!(queue = %self.config.queue_name, "Consumer stopped."),
      Err(terminal) => error!(queue = %self.config.queue_name, "Consumer terminated: {terminal}"),
    }
    outcome
  }

  async fn consume_loop(
    &self,
    pool: &Arc<BoundedPool<()>>,
    poll_timeout: Duration,
  ) -> Result<(), TaskError> {
    while self.consuming.load(AtomicOrdering::SeqCst) {
      let Some(payload) = self.broker.pop(&self.config.queue_name, poll_timeout).await? else {
        continue; // poll timed out; recheck the stop flag
      };

      let args: A = match self.config.serializer.decode(&payload) {
        Ok(args) => args,
        Err(undecodable) => {
          warn!(queue = %self.config.queue_name, "Skipping undecodable payload: {undecodable}");
          continue;
        }
      };

      let handler = self.handler.clone();
      let queue_name = self.config.queue_name.clone();
      let unit: WorkUnit<()> = Box::pin(async move {
        if let Err(cause) = handler(args).await {
          error!(queue = %queue_name, "Work unit failed: {cause}");
        }
        Ok(())
      });

      pool.submit(unit, true).await?;
    }
    Ok(())
  }

  /// Signals the consume loop to stop. The loop notices at its next
  /// poll boundary, drains its local pool, and returns; a new `consume`
  /// may be started afterwards.
  pub fn stop(&self) {
    info!(queue = %self.config.queue_name, "Stop requested for consumer.");
    self.consuming.store(false, AtomicOrdering::SeqCst);
  }

  /// Number of call records waiting on the broker.
  pub async fn queue_len(&self) -> Result<usize, TaskError> {
    Ok(self.broker.len(&self.config.queue_name).await?)
  }

  /// Purges every pending call record from the broker queue.
  pub async fn clear_queue(&self) -> Result<(), TaskError> {
    Ok(self.broker.clear(&self.config.queue_name).await?)
  }

  /// Releases the broker connection.
  pub async fn close(&self) -> Result<(), TaskError> {
    Ok(self.broker.close().await?)
  }
}

/// Type-erased view of a named task, letting differently typed tasks
/// share one consumer fan-out.
#[async_trait]
pub trait ConsumeTask: Send + Sync {
  fn queue_name(&self) -> &str;
  async fn consume(&self) -> Result<(), TaskError>;
  fn stop(&self);
}

#[async_trait]
impl<A, R> ConsumeTask for NamedTask<A, R>
where
  A: Serialize + DeserializeOwned + Send + 'static,
  R: Send + 'static,
{
  fn queue_name(&self) -> &str {
    &self.config.queue_name
  }

  async fn consume(&self) -> Result<(), TaskError> {
    NamedTask::consume(self).await
  }

  fn stop(&self) {
    NamedTask::stop(self)
  }
}

/// Runs every task's consumer concurrently. A failing consumer is
/// logged and does not abort its siblings; the call returns when all
/// consumers have stopped.
pub async fn batch_consume(tasks: &[&dyn ConsumeTask]) {
  info!(count = tasks.len(), "Starting batch consumers.");
  let consumers = tasks.iter().map(|task| async move {
    if let Err(terminal) = task.consume().await {
      error!(queue = %task.queue_name(), "Consumer failed: {terminal}");
    }
  });
  join_all(consumers).await;
}
