use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::{debug, info};

/// Drain behavior shared by both pool variants, so one registry can
/// hold them all. Bounded pools drain via `shutdown(wait = true)`;
/// direct pools drain via `wait()`.
#[async_trait]
pub(crate) trait DrainTarget: Send + Sync {
  async fn drain(&self);
  fn pool_name(&self) -> &str;
}

lazy_static::lazy_static! {
  static ref ACTIVE_POOLS: Mutex<Vec<Weak<dyn DrainTarget>>> = Mutex::new(Vec::new());
}

/// Registers a freshly created pool. Only a weak reference is held, so
/// the registry never extends a pool's lifetime.
pub(crate) fn register(pool: Arc<dyn DrainTarget>) {
  let mut guard = ACTIVE_POOLS.lock().unwrap();
  guard.retain(|candidate| candidate.strong_count() > 0);
  guard.push(Arc::downgrade(&pool));
}

/// Drains every live pool in the process, in registration order.
///
/// Programs that submit fire-and-forget work otherwise return from
/// their async entry point with units still sitting in staging queues;
/// placing a single `shutdown_all().await` as the last line of the
/// entry point, while the pools are still in scope, closes that gap.
/// Idempotent, and safe to call while pools are still in use: each
/// pool's own drain semantics apply.
pub async fn shutdown_all() {
  // Dead entries are pruned; live pools stay registered so a later
  // sweep covers them again (a drained direct pool remains usable).
  let pools: Vec<Arc<dyn DrainTarget>> = {
    let mut guard = ACTIVE_POOLS.lock().unwrap();
    guard.retain(|candidate| candidate.strong_count() > 0);
    guard.iter().filter_map(Weak::upgrade).collect()
  };

  if pools.is_empty() {
    debug!("shutdown_all: no live pools to drain.");
    return;
  }

  info!(count = pools.len(), "Draining all registered pools.");
  for pool in pools {
    debug!(pool_name = %pool.pool_name(), "Draining pool.");
    pool.drain().await;
  }
}
