use futures_sluice::{shutdown_all, BoundedPool, DirectPool, WorkUnit};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn fire_and_forget_work() {
  // Fire-and-forget: nobody keeps the slots. Without a drain these
  // units would still be sitting in the staging queue when the entry
  // point returns.
  let pool = BoundedPool::<()>::new(2, 100, Handle::current(), "forgetful_pool");
  let direct = DirectPool::<()>::new(3, Handle::current(), "forgetful_direct");

  for i in 0..10 {
    let unit: WorkUnit<()> = Box::pin(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      info!("bounded unit {} done", i);
      Ok(())
    });
    pool.submit(unit, true).await.unwrap();

    let unit: WorkUnit<()> = Box::pin(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      info!("direct unit {} done", i);
      Ok(())
    });
    direct.submit(unit).await.unwrap();
  }

  info!("All work submitted; draining every live pool before returning.");
  shutdown_all().await;
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Scoped & Drain Demo ---");

  // Variant 1: a scoped pool drains itself on every exit path.
  let pool = BoundedPool::<u64>::new(2, 10, Handle::current(), "scoped_pool");
  let total = pool
    .scoped(|pool| async move {
      let mut slots = Vec::new();
      for i in 0..6u64 {
        let unit: WorkUnit<u64> = Box::pin(async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(i)
        });
        slots.push(pool.submit(unit, true).await.unwrap());
      }
      let mut total = 0;
      for slot in slots {
        total += slot.wait().await.unwrap();
      }
      total
    })
    .await;
  info!("Scoped block finished with total {} and a fully drained pool.", total);

  // Variant 2: one explicit drain call at the end of the entry point.
  fire_and_forget_work().await;

  info!("--- Scoped & Drain Demo End ---");
}
