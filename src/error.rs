use thiserror::Error;

/// The boxed cause a failing work unit reports through its result slot.
///
/// Keeping the cause as a trait object preserves its concrete type, so
/// callers can `downcast_ref` after matching [`PoolError::UnitFailed`].
pub type UnitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the pool engine.
#[derive(Error, Debug)]
pub enum PoolError {
  #[error("staging queue is full")]
  QueueFull,

  #[error("pool is closed and no longer accepts work")]
  PoolClosed,

  #[error("work unit failed: {0}")]
  UnitFailed(#[source] UnitError),

  #[error("work unit panicked during execution")]
  UnitPanicked,

  #[error("result slot was dropped before the unit resolved")]
  SlotDropped,
}
