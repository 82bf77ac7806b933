use futures_sluice::{batch_consume, Broker, ConsumeTask, MemoryBroker, TaskBuilder, UnitError};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Distributed Queue Demo ---");

  // The in-memory broker keeps the demo self-contained. Against a real
  // Redis, replace `bind` with:
  //   TaskBuilder::new("demo_add").connect(handler).await?
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

  let add_task = Arc::new(
    TaskBuilder::new("demo_add")
      .max_concurrency(10)
      .poll_timeout(Duration::from_secs(1))
      .bind(broker.clone(), |(a, b): (i64, i64)| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        info!("add: {} + {} = {}", a, b, a + b);
        Ok::<i64, UnitError>(a + b)
      }),
  );

  let multiply_task = Arc::new(
    TaskBuilder::new("demo_multiply")
      .max_concurrency(5)
      .poll_timeout(Duration::from_secs(1))
      .bind(broker.clone(), |(a, b): (i64, i64)| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("multiply: {} * {} = {}", a, b, a * b);
        Ok::<i64, UnitError>(a * b)
      }),
  );

  // Direct call, bypassing the queue entirely.
  info!("Direct call: {}", add_task.call((1, 2)).await.unwrap());

  // Producer side: push call records onto the broker.
  for i in 0..20 {
    add_task.submit((i, i + 1)).await.unwrap();
  }
  for i in 0..10 {
    multiply_task.submit((i, 2)).await.unwrap();
  }
  info!(
    "Queue depths before consuming: add={} multiply={}",
    add_task.queue_len().await.unwrap(),
    multiply_task.queue_len().await.unwrap()
  );

  // Consumer side: run both consumers until their queues go idle.
  let consumers = {
    let add_task = add_task.clone();
    let multiply_task = multiply_task.clone();
    tokio::spawn(async move {
      batch_consume(&[add_task.as_ref() as &dyn ConsumeTask, multiply_task.as_ref()]).await;
    })
  };

  while add_task.queue_len().await.unwrap() + multiply_task.queue_len().await.unwrap() > 0 {
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
  tokio::time::sleep(Duration::from_millis(500)).await; // let in-flight handlers finish
  add_task.stop();
  multiply_task.stop();
  consumers.await.unwrap();

  info!("--- Distributed Queue Demo End ---");
}
