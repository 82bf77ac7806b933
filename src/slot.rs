use crate::error::PoolError;

use tokio::sync::oneshot;
use tracing::debug;

/// The submitter's half of a one-shot result slot.
///
/// Returned by `submit`; resolved exactly once by the worker that runs
/// the unit, with the unit's value, its error, or a pool error.
#[derive(Debug)]
pub struct ResultSlot<R> {
  pub(crate) unit_id: u64,
  pub(crate) receiver: oneshot::Receiver<Result<R, PoolError>>,
}

impl<R> ResultSlot<R> {
  /// Returns the unique ID of the unit this slot belongs to.
  pub fn id(&self) -> u64 {
    self.unit_id
  }

  /// Suspends until the unit resolves and returns its outcome.
  ///
  /// # Errors
  /// Returns [`PoolError::UnitFailed`] when the unit returned an error,
  /// [`PoolError::UnitPanicked`] when it panicked, and
  /// [`PoolError::SlotDropped`] when the worker half vanished without
  /// resolving the slot (forced teardown).
  pub async fn wait(self) -> Result<R, PoolError> {
    match self.receiver.await {
      Ok(outcome) => outcome,
      Err(_closed) => Err(PoolError::SlotDropped),
    }
  }
}

/// The worker's half of a result slot. Settable exactly once; consumed
/// by `fulfill`.
pub(crate) struct SlotWriter<R> {
  unit_id: u64,
  sender: oneshot::Sender<Result<R, PoolError>>,
}

impl<R> SlotWriter<R> {
  pub(crate) fn fulfill(self, outcome: Result<R, PoolError>) {
    if self.sender.send(outcome).is_err() {
      // Fire-and-forget submitters drop their slots; this is routine.
      debug!(unit_id = self.unit_id, "Result receiver dropped before resolution.");
    }
  }
}

/// Creates a connected writer/slot pair for one work unit.
pub(crate) fn pair<R>(unit_id: u64) -> (SlotWriter<R>, ResultSlot<R>) {
  let (sender, receiver) = oneshot::channel();
  (SlotWriter { unit_id, sender }, ResultSlot { unit_id, receiver })
}
