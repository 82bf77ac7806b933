use crate::error::PoolError;
use crate::queue::{QueueItem, StagedUnit, StagingQueue, WorkUnit};
use crate::registry::{self, DrainTarget};
use crate::slot::{self, ResultSlot};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_UNIT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

pub(crate) fn next_unit_id() -> u64 {
  NEXT_UNIT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A back-pressured concurrency pool.
///
/// A fixed fleet of `max_concurrency` workers consumes a bounded
/// staging queue of capacity `max_queue_size`. Submitting with
/// `blocking = true` suspends the producer while the queue is full,
/// which caps a program's work-in-flight at
/// `max_queue_size + max_concurrency` no matter how many units it
/// submits overall.
pub struct BoundedPool<R: Send + 'static> {
  pool_name: Arc<String>,
  max_concurrency: usize,
  queue: StagingQueue<R>,
  active_units: Arc<AtomicUsize>,
  closed: CancellationToken,
  shutdown_started: AtomicBool,
  workers: TaskTracker,
  tokio_handle: TokioHandle,
}

impl<R: Send + 'static> BoundedPool<R> {
  /// Creates a pool and spawns its worker fleet on `tokio_handle`.
  ///
  /// The pool registers itself with the process-wide registry, so a
  /// single [`shutdown_all`](crate::shutdown_all) at the end of an
  /// async entry point drains it along with every other live pool.
  pub fn new(
    max_concurrency: usize,
    max_queue_size: usize,
    tokio_handle: TokioHandle,
    pool_name: &str,
  ) -> Arc<Self> {
    let max_concurrency = max_concurrency.max(1);
    let queue = StagingQueue::new(max_queue_size);
    let active_units = Arc::new(AtomicUsize::new(0));
    let pool_name_arc = Arc::new(pool_name.to_string());

    let workers = TaskTracker::new();
    for index in 0..max_concurrency {
      let worker_name = pool_name_arc.clone();
      let worker_rx = queue.consumer();
      let worker_active = active_units.clone();
      workers.spawn_on(
        Self::worker_loop(worker_name, index, worker_rx, worker_active)
          .instrument(info_span!("pool_worker", pool_name = %pool_name, index)),
        &tokio_handle,
      );
    }

    let pool = Arc::new(Self {
      pool_name: pool_name_arc,
      max_concurrency,
      queue,
      active_units,
      closed: CancellationToken::new(),
      shutdown_started: AtomicBool::new(false),
      workers,
      tokio_handle,
    });

    registry::register(pool.clone());
    info!(
      pool_name = %pool.pool_name,
      max_concurrency,
      max_queue_size,
      "Pool created, worker fleet started."
    );
    pool
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  /// Units currently waiting in the staging queue.
  pub fn queued_unit_count(&self) -> usize {
    self.queue.len()
  }

  /// Units claimed by a worker whose slots have not resolved yet.
  pub fn active_unit_count(&self) -> usize {
    self.active_units.load(AtomicOrdering::SeqCst)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Wraps `unit` with a fresh result slot and hands it to the staging
  /// queue, returning the slot.
  ///
  /// With `blocking = true` the call suspends while the queue is full;
  /// otherwise it fails fast with [`PoolError::QueueFull`]. Either way
  /// the call returns only once the unit is in the queue's custody:
  /// a returned slot is a unit that will be executed (or resolved with
  /// `PoolClosed` if shutdown overtakes it).
  pub async fn submit(&self, unit: WorkUnit<R>, blocking: bool) -> Result<ResultSlot<R>, PoolError> {
    if self.closed.is_cancelled() {
      warn!(pool_name = %self.pool_name, "Submit attempted on a closed pool.");
      return Err(PoolError::PoolClosed);
    }

    let unit_id = next_unit_id();
    let (writer, slot_handle) = slot::pair(unit_id);
    let staged = StagedUnit { unit_id, future: unit, slot: writer };

    trace!(pool_name = %self.pool_name, unit_id, blocking, "Submitting unit to staging queue.");
    self.queue.push(staged, blocking, &self.closed).await?;
    Ok(slot_handle)
  }

  /// Submits `unit` and waits for its outcome in one call.
  pub async fn run(&self, unit: WorkUnit<R>, blocking: bool) -> Result<R, PoolError> {
    self.submit(unit, blocking).await?.wait().await
  }

  /// Submits every unit in order and returns their slots.
  ///
  /// Pushes are sequential, so the batch keeps FIFO order among its own
  /// units; other producers may interleave at push boundaries.
  pub async fn batch_submit(
    &self,
    units: Vec<WorkUnit<R>>,
    blocking: bool,
  ) -> Result<Vec<ResultSlot<R>>, PoolError> {
    let mut slots = Vec::with_capacity(units.len());
    for unit in units {
      slots.push(self.submit(unit, blocking).await?);
    }
    Ok(slots)
  }

  /// `batch_submit` followed by waiting on every slot; values come back
  /// in submission order regardless of completion order.
  pub async fn batch_run(&self, units: Vec<WorkUnit<R>>, blocking: bool) -> Result<Vec<R>, PoolError> {
    let slots = self.batch_submit(units, blocking).await?;
    let mut values = Vec::with_capacity(slots.len());
    for slot_handle in slots {
      values.push(slot_handle.wait().await?);
    }
    Ok(values)
  }

  /// Submits from a synchronous context by blocking the calling thread
  /// on the pool's runtime handle.
  ///
  /// # Panics
  /// Panics if called from within an asynchronous execution context;
  /// use [`submit`](Self::submit) there instead.
  pub fn blocking_submit(&self, unit: WorkUnit<R>, blocking: bool) -> Result<ResultSlot<R>, PoolError> {
    self.tokio_handle.block_on(self.submit(unit, blocking))
  }

  /// Closes the pool and drains it.
  ///
  /// The first caller marks the pool closed and enqueues one shutdown
  /// sentinel per worker, behind every unit accepted so far. With
  /// `wait = true` the call then suspends until every worker has
  /// terminated, which by queue order happens only after all accepted
  /// units resolved their slots. Idempotent, and safe to call
  /// concurrently: the sentinel phase runs once, and every waiting
  /// caller suspends on the same worker tracker until the fleet is
  /// gone.
  pub async fn shutdown(&self, wait: bool) {
    if !self.shutdown_started.swap(true, AtomicOrdering::SeqCst) {
      info!(pool_name = %self.pool_name, wait, "Initiating pool shutdown.");
      self.closed.cancel();
      self.workers.close();
      for _ in 0..self.max_concurrency {
        if self.queue.push_sentinel().await.is_err() {
          warn!(pool_name = %self.pool_name, "Staging channel closed while delivering sentinels.");
          break;
        }
      }
    } else {
      debug!(pool_name = %self.pool_name, "Shutdown already in progress or completed.");
    }

    if wait {
      // Every waiting caller joins the whole fleet here, including the
      // ones that lost the sentinel race; nothing below runs while a
      // worker could still claim units.
      self.workers.wait().await;

      // A submit that passed the closed check while sentinels were being
      // delivered can land behind them; resolve whatever is left.
      while let Some(item) = self.queue.try_pop() {
        if let QueueItem::Unit(staged) = item {
          debug!(pool_name = %self.pool_name, unit_id = staged.unit_id, "Resolving straggler unit as closed.");
          staged.slot.fulfill(Err(PoolError::PoolClosed));
        }
      }
      self.queue.close();
      info!(pool_name = %self.pool_name, "Pool drained and shut down.");
    }
  }

  /// Runs `scope` with this pool and guarantees a full drain
  /// (`shutdown(wait = true)`) on every exit path, panics included.
  pub async fn scoped<T, F, Fut>(self: &Arc<Self>, scope: F) -> T
  where
    F: FnOnce(Arc<Self>) -> Fut,
    Fut: Future<Output = T>,
  {
    let outcome = AssertUnwindSafe(scope(self.clone())).catch_unwind().await;
    self.shutdown(true).await;
    match outcome {
      Ok(value) => value,
      Err(panic_payload) => std::panic::resume_unwind(panic_payload),
    }
  }

  async fn worker_loop(
    pool_name: Arc<String>,
    index: usize,
    staging_rx: kanal::AsyncReceiver<QueueItem<R>>,
    active_units: Arc<AtomicUsize>,
  ) {
    trace!(pool_name = %pool_name, index, "Worker started.");
    loop {
      match staging_rx.recv().await {
        Ok(QueueItem::Unit(staged)) => {
          let unit_id = staged.unit_id;
          active_units.fetch_add(1, AtomicOrdering::SeqCst);

          let outcome = AssertUnwindSafe(staged.future).catch_unwind().await;
          let resolution = match outcome {
            Ok(Ok(value)) => {
              trace!(pool_name = %pool_name, unit_id, "Unit completed.");
              Ok(value)
            }
            Ok(Err(cause)) => {
              debug!(pool_name = %pool_name, unit_id, "Unit failed: {cause}");
              Err(PoolError::UnitFailed(cause))
            }
            Err(_panic_payload) => {
              error!(pool_name = %pool_name, unit_id, "Unit panicked.");
              Err(PoolError::UnitPanicked)
            }
          };

          staged.slot.fulfill(resolution);
          active_units.fetch_sub(1, AtomicOrdering::SeqCst);
        }
        Ok(QueueItem::Shutdown) => {
          debug!(pool_name = %pool_name, index, "Shutdown sentinel received. Worker terminating.");
          break;
        }
        Err(_disconnected) => {
          debug!(pool_name = %pool_name, index, "Staging channel closed. Worker terminating.");
          break;
        }
      }
    }
    trace!(pool_name = %pool_name, index, "Worker stopped.");
  }
}

#[async_trait]
impl<R: Send + 'static> DrainTarget for BoundedPool<R> {
  async fn drain(&self) {
    self.shutdown(true).await;
  }

  fn pool_name(&self) -> &str {
    &self.pool_name
  }
}

impl<R: Send + 'static> fmt::Debug for BoundedPool<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundedPool")
      .field("pool_name", &self.pool_name)
      .field("max_concurrency", &self.max_concurrency)
      .field("queued", &self.queued_unit_count())
      .field("active", &self.active_unit_count())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<R: Send + 'static> Drop for BoundedPool<R> {
  fn drop(&mut self) {
    if !self.closed.is_cancelled() {
      // Dropping the queue's sender side disconnects the channel and
      // the workers terminate on their own. Only an explicit shutdown
      // (or shutdown_all) guarantees accepted units are processed
      // before the runtime goes away.
      debug!(
        pool_name = %self.pool_name,
        "Pool dropped without explicit shutdown; workers will terminate on disconnect."
      );
      self.closed.cancel();
    }
  }
}
