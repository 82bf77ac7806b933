use crate::error::{PoolError, UnitError};
use crate::slot::SlotWriter;

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// The deferred computation a pool executes once. The `Err` arm is the
/// unit's own failure; it lands in the submitter's result slot as
/// [`PoolError::UnitFailed`](crate::PoolError::UnitFailed).
pub type WorkUnit<R> = Pin<Box<dyn Future<Output = Result<R, UnitError>> + Send + 'static>>;

/// A work unit in transit: the future plus the slot writer it resolves.
/// Owned by the queue until a worker claims it, then by that worker.
pub(crate) struct StagedUnit<R: Send + 'static> {
  pub(crate) unit_id: u64,
  pub(crate) future: WorkUnit<R>,
  pub(crate) slot: SlotWriter<R>,
}

/// What travels through the staging channel: a unit, or one shutdown
/// sentinel per worker.
pub(crate) enum QueueItem<R: Send + 'static> {
  Unit(StagedUnit<R>),
  Shutdown,
}

/// Bounded FIFO buffer between submitters and the worker fleet.
///
/// Built on a `kanal` MPMC channel so producers and the worker fleet
/// both attach directly. Capacity zero degenerates to a rendezvous
/// channel: a push succeeds only by handing the unit straight to an
/// idle worker.
pub(crate) struct StagingQueue<R: Send + 'static> {
  tx: kanal::AsyncSender<QueueItem<R>>,
  rx: kanal::AsyncReceiver<QueueItem<R>>,
}

impl<R: Send + 'static> StagingQueue<R> {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = kanal::bounded_async(capacity);
    Self { tx, rx }
  }

  /// Hands a unit to the queue.
  ///
  /// A blocking push suspends while the queue is at capacity and aborts
  /// with [`PoolError::PoolClosed`] if the pool closes first. A
  /// non-blocking push fails with [`PoolError::QueueFull`] instead of
  /// suspending.
  pub(crate) async fn push(
    &self,
    unit: StagedUnit<R>,
    blocking: bool,
    closed: &CancellationToken,
  ) -> Result<(), PoolError> {
    if blocking {
      tokio::select! {
        biased;
        _ = closed.cancelled() => Err(PoolError::PoolClosed),
        sent = self.tx.send(QueueItem::Unit(unit)) => sent.map_err(|_| PoolError::PoolClosed),
      }
    } else {
      match self.tx.try_send(QueueItem::Unit(unit)) {
        Ok(true) => Ok(()),
        Ok(false) => Err(PoolError::QueueFull),
        Err(_closed) => Err(PoolError::PoolClosed),
      }
    }
  }

  /// Delivers one shutdown sentinel. Always suspends until a slot
  /// frees; issued only by `shutdown` after the closed flag is set, so
  /// every sentinel lands behind every accepted unit.
  pub(crate) async fn push_sentinel(&self) -> Result<(), PoolError> {
    self
      .tx
      .send(QueueItem::Shutdown)
      .await
      .map_err(|_| PoolError::PoolClosed)
  }

  /// Non-suspending pop used to drain stragglers once the workers have
  /// terminated.
  pub(crate) fn try_pop(&self) -> Option<QueueItem<R>> {
    self.rx.try_recv().ok().flatten()
  }

  /// Best-effort element count for observability.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  /// A cloned consumer half for one worker.
  pub(crate) fn consumer(&self) -> kanal::AsyncReceiver<QueueItem<R>> {
    self.rx.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::slot;
  use std::time::Duration;

  fn dummy_unit(unit_id: u64) -> StagedUnit<u32> {
    let future: WorkUnit<u32> = Box::pin(async move { Ok(unit_id as u32) });
    let (writer, _slot) = slot::pair(unit_id);
    StagedUnit { unit_id, future, slot: writer }
  }

  #[tokio::test]
  async fn test_push_pop_preserves_fifo() {
    let queue = StagingQueue::<u32>::new(4);
    let closed = CancellationToken::new();

    for id in 0..4 {
      queue.push(dummy_unit(id), true, &closed).await.unwrap();
    }
    assert_eq!(queue.len(), 4);

    let rx = queue.consumer();
    for expected in 0..4 {
      match rx.recv().await.unwrap() {
        QueueItem::Unit(staged) => assert_eq!(staged.unit_id, expected),
        QueueItem::Shutdown => panic!("unexpected sentinel"),
      }
    }
  }

  #[tokio::test]
  async fn test_nonblocking_push_fails_when_full() {
    let queue = StagingQueue::<u32>::new(1);
    let closed = CancellationToken::new();

    queue.push(dummy_unit(1), false, &closed).await.unwrap();
    let result = queue.push(dummy_unit(2), false, &closed).await;
    assert!(matches!(result, Err(PoolError::QueueFull)));
  }

  #[tokio::test]
  async fn test_blocking_push_suspends_until_capacity_frees() {
    let queue = StagingQueue::<u32>::new(1);
    let closed = CancellationToken::new();

    queue.push(dummy_unit(1), true, &closed).await.unwrap();

    let blocked = queue.push(dummy_unit(2), true, &closed);
    tokio::pin!(blocked);
    tokio::select! {
      _ = &mut blocked => panic!("push should suspend while the queue is full"),
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    let rx = queue.consumer();
    assert!(matches!(rx.recv().await.unwrap(), QueueItem::Unit(_)));
    tokio::time::timeout(Duration::from_millis(100), blocked)
      .await
      .expect("push did not resume after a slot freed")
      .unwrap();
  }

  #[tokio::test]
  async fn test_blocking_push_aborts_when_pool_closes() {
    let queue = StagingQueue::<u32>::new(1);
    let closed = CancellationToken::new();

    queue.push(dummy_unit(1), true, &closed).await.unwrap();

    let blocked = queue.push(dummy_unit(2), true, &closed);
    tokio::pin!(blocked);
    tokio::select! {
      _ = &mut blocked => panic!("push should suspend while the queue is full"),
      _ = tokio::time::sleep(Duration::from_millis(20)) => closed.cancel(),
    }
    assert!(matches!(blocked.await, Err(PoolError::PoolClosed)));
  }
}
