use futures_sluice::{BoundedPool, WorkUnit};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Back-pressure Demo ---");
  info!("200 units through 4 workers and a staging queue of 8.");
  info!("The producer loop is throttled to consumer speed; watch the queue depth.");

  let pool = BoundedPool::<u64>::new(4, 8, Handle::current(), "backpressure_pool");
  let started = Instant::now();

  let mut slots = Vec::new();
  for i in 0..200u64 {
    let unit: WorkUnit<u64> = Box::pin(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok(i * 2)
    });
    // Blocking submit: this await is where an unbounded producer gets
    // slowed down to the rate the workers can sustain.
    slots.push(pool.submit(unit, true).await.unwrap());

    if i % 50 == 0 {
      info!(
        "submitted={} queued={} active={}",
        i + 1,
        pool.queued_unit_count(),
        pool.active_unit_count()
      );
    }
  }

  let mut sum = 0u64;
  for slot in slots {
    sum += slot.wait().await.unwrap();
  }

  info!(
    "All 200 units resolved in {:?} (sum = {}). Peak memory held only ~12 units at a time.",
    started.elapsed(),
    sum
  );

  pool.shutdown(true).await;
  info!("--- Back-pressure Demo End ---");
}
