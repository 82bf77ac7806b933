use crate::error::PoolError;
use crate::pool::next_unit_id;
use crate::queue::WorkUnit;
use crate::registry::{self, DrainTarget};
use crate::slot::{self, ResultSlot};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, Instrument};

/// The strict concurrency-bounded pool: no staging queue.
///
/// `submit` itself is the back-pressure point: it suspends until an
/// execution slot is free, then spawns the unit immediately. A
/// semaphore permit is acquired before the spawn and released only
/// after the unit's slot is resolved, so the in-flight count can never
/// cross `max_concurrency`, not even momentarily under concurrent
/// submission.
pub struct DirectPool<R: Send + 'static> {
  pool_name: Arc<String>,
  max_concurrency: usize,
  semaphore: Arc<Semaphore>,
  tracker: TaskTracker,
  tokio_handle: TokioHandle,
  _result: std::marker::PhantomData<fn() -> R>,
}

impl<R: Send + 'static> DirectPool<R> {
  /// Creates the pool and registers it for the process-wide drain.
  pub fn new(max_concurrency: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let max_concurrency = max_concurrency.max(1);
    let pool = Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      max_concurrency,
      semaphore: Arc::new(Semaphore::new(max_concurrency)),
      tracker: TaskTracker::new(),
      tokio_handle,
      _result: std::marker::PhantomData,
    });
    registry::register(pool.clone());
    info!(pool_name = %pool.pool_name, max_concurrency, "Direct pool created.");
    pool
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  /// Units spawned and not yet resolved.
  pub fn in_flight(&self) -> usize {
    self.max_concurrency - self.semaphore.available_permits()
  }

  /// Submits a unit, suspending while the pool is at its cap.
  ///
  /// The returned slot resolves once the unit completes; the execution
  /// slot is handed back the moment the result is written.
  pub async fn submit(&self, unit: WorkUnit<R>) -> Result<ResultSlot<R>, PoolError> {
    let permit = self
      .semaphore
      .clone()
      .acquire_owned()
      .await
      .map_err(|_closed| PoolError::PoolClosed)?;

    let unit_id = next_unit_id();
    let (writer, slot_handle) = slot::pair(unit_id);
    let pool_name = self.pool_name.clone();

    self.tracker.spawn_on(
      async move {
        let _execution_slot = permit;
        let outcome = AssertUnwindSafe(unit).catch_unwind().await;
        let resolution = match outcome {
          Ok(Ok(value)) => Ok(value),
          Ok(Err(cause)) => {
            debug!(pool_name = %pool_name, unit_id, "Unit failed: {cause}");
            Err(PoolError::UnitFailed(cause))
          }
          Err(_panic_payload) => {
            error!(pool_name = %pool_name, unit_id, "Unit panicked.");
            Err(PoolError::UnitPanicked)
          }
        };
        writer.fulfill(resolution);
      }
      .instrument(info_span!("direct_unit", pool_name = %self.pool_name, unit_id)),
      &self.tokio_handle,
    );

    Ok(slot_handle)
  }

  /// Submits `unit` and waits for its outcome in one call.
  pub async fn run(&self, unit: WorkUnit<R>) -> Result<R, PoolError> {
    self.submit(unit).await?.wait().await
  }

  /// Suspends until every in-flight unit has resolved. The pool stays
  /// usable afterwards.
  pub async fn wait(&self) {
    self.tracker.close();
    self.tracker.wait().await;
    self.tracker.reopen();
  }

  /// Runs `scope` with this pool and guarantees a drain (`wait`) on
  /// every exit path, panics included.
  pub async fn scoped<T, F, Fut>(self: &Arc<Self>, scope: F) -> T
  where
    F: FnOnce(Arc<Self>) -> Fut,
    Fut: Future<Output = T>,
  {
    let outcome = AssertUnwindSafe(scope(self.clone())).catch_unwind().await;
    self.wait().await;
    match outcome {
      Ok(value) => value,
      Err(panic_payload) => std::panic::resume_unwind(panic_payload),
    }
  }
}

#[async_trait]
impl<R: Send + 'static> DrainTarget for DirectPool<R> {
  async fn drain(&self) {
    self.wait().await;
  }

  fn pool_name(&self) -> &str {
    &self.pool_name
  }
}

impl<R: Send + 'static> fmt::Debug for DirectPool<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DirectPool")
      .field("pool_name", &self.pool_name)
      .field("max_concurrency", &self.max_concurrency)
      .field("in_flight", &self.in_flight())
      .finish()
  }
}
