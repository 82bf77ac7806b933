use futures_sluice::{BoundedPool, PoolError, UnitError, WorkUnit};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
#[error("order {0} was refused")]
struct OrderRefused(usize);

fn order_unit(order: usize, reject: bool) -> WorkUnit<String> {
  Box::pin(async move {
    tokio::time::sleep(Duration::from_millis(300)).await;
    if reject {
      return Err::<String, UnitError>(Box::new(OrderRefused(order)));
    }
    Ok(format!("order {} shipped", order))
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Submission Modes Demo ---");

  // Two workers and a single staging slot: small enough that a burst
  // of non-blocking submits visibly overflows.
  let pool = BoundedPool::<String>::new(2, 1, Handle::current(), "orders_pool");
  tokio::time::sleep(Duration::from_millis(50)).await; // let the workers go idle

  // Non-blocking submits fail fast with QueueFull once the workers and
  // the staging slot are taken; the caller decides what to do with the
  // overflow instead of being suspended.
  let mut accepted = Vec::new();
  let mut overflow = Vec::new();
  for order in 0..6 {
    match pool.submit(order_unit(order, false), false).await {
      Ok(slot) => accepted.push(slot),
      Err(PoolError::QueueFull) => {
        warn!("order {} bounced, queuing it for a blocking retry", order);
        overflow.push(order);
      }
      Err(other) => {
        warn!("order {} failed outright: {:?}", order, other);
        return;
      }
    }
  }
  info!(
    "burst of 6: {} accepted immediately, {} overflowed (queued={}, active={})",
    accepted.len(),
    overflow.len(),
    pool.queued_unit_count(),
    pool.active_unit_count()
  );

  // The bounced orders go back in with blocking submits; each call now
  // suspends until the pool has room rather than erroring.
  for order in overflow {
    let slot = pool.submit(order_unit(order, false), true).await.unwrap();
    info!("order {} re-submitted with back-pressure (slot id {})", order, slot.id());
    accepted.push(slot);
  }

  for slot in accepted {
    info!("{}", slot.wait().await.unwrap());
  }

  // A unit that fails keeps its concrete error type across the slot.
  match pool.run(order_unit(99, true), true).await {
    Err(PoolError::UnitFailed(cause)) => match cause.downcast_ref::<OrderRefused>() {
      Some(refused) => info!("rejection surfaced with its own type: {}", refused),
      None => warn!("cause lost its type: {}", cause),
    },
    other => warn!("expected a refusal, got {:?}", other),
  }

  pool.shutdown(true).await;
  info!("--- Submission Modes Demo End ---");
}
