use futures_sluice::{batch_consume, Broker, ConsumeTask, MemoryBroker, NamedTask, Serializer, TaskBuilder, UnitError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_sluice=debug"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn adder_task(
  queue_name: &str,
  broker: Arc<dyn Broker>,
  invocations: Arc<AtomicUsize>,
  sum: Arc<AtomicUsize>,
) -> NamedTask<(usize, usize), usize> {
  TaskBuilder::new(queue_name)
    .max_concurrency(3)
    .poll_timeout(Duration::from_secs(1))
    .bind(broker, move |(a, b): (usize, usize)| {
      let invocations = invocations.clone();
      let sum = sum.clone();
      async move {
        invocations.fetch_add(1, Ordering::SeqCst);
        sum.fetch_add(a + b, Ordering::SeqCst);
        Ok::<usize, UnitError>(a + b)
      }
    })
}

async fn wait_for_count(counter: &AtomicUsize, expected: usize, budget: Duration) {
  let deadline = tokio::time::Instant::now() + budget;
  while counter.load(Ordering::SeqCst) < expected {
    assert!(
      tokio::time::Instant::now() < deadline,
      "only {} of {expected} invocations arrived in time",
      counter.load(Ordering::SeqCst)
    );
    sleep(Duration::from_millis(10)).await;
  }
}

#[tokio::test]
async fn test_call_bypasses_the_broker() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let invocations = Arc::new(AtomicUsize::new(0));
  let sum = Arc::new(AtomicUsize::new(0));
  let task = adder_task("bypass", broker.clone(), invocations, sum);

  assert_eq!(task.call((1, 2)).await.unwrap(), 3);
  assert_eq!(task.queue_len().await.unwrap(), 0, "direct calls must not touch the queue");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_submissions_all_consumed() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let invocations = Arc::new(AtomicUsize::new(0));
  let sum = Arc::new(AtomicUsize::new(0));
  let task = Arc::new(adder_task("q1", broker.clone(), invocations.clone(), sum.clone()));

  for _ in 0..1000 {
    task.submit((1, 2)).await.unwrap();
  }
  assert_eq!(task.queue_len().await.unwrap(), 1000);

  let consumer = {
    let task = task.clone();
    tokio::spawn(async move { task.consume_with_timeout(Duration::from_millis(100)).await })
  };

  wait_for_count(&invocations, 1000, Duration::from_secs(20)).await;
  task.stop();
  consumer.await.unwrap().unwrap();

  assert_eq!(invocations.load(Ordering::SeqCst), 1000);
  assert_eq!(sum.load(Ordering::SeqCst), 3000);
  assert_eq!(task.queue_len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_payloads_are_skipped() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let invocations = Arc::new(AtomicUsize::new(0));
  let sum = Arc::new(AtomicUsize::new(0));
  let task = Arc::new(adder_task("garbled", broker.clone(), invocations.clone(), sum.clone()));

  task.submit((2, 3)).await.unwrap();
  broker.push("garbled", b"definitely not a record".to_vec()).await.unwrap();
  task.submit((4, 5)).await.unwrap();

  let consumer = {
    let task = task.clone();
    tokio::spawn(async move { task.consume_with_timeout(Duration::from_millis(50)).await })
  };

  wait_for_count(&invocations, 2, Duration::from_secs(5)).await;
  task.stop();
  consumer.await.unwrap().unwrap();

  assert_eq!(invocations.load(Ordering::SeqCst), 2);
  assert_eq!(sum.load(Ordering::SeqCst), 14);
  assert_eq!(task.queue_len().await.unwrap(), 0, "the garbled payload must be discarded");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_handler_does_not_kill_the_consumer() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let attempts = Arc::new(AtomicUsize::new(0));

  let task = {
    let attempts = attempts.clone();
    Arc::new(
      TaskBuilder::new("flaky")
        .max_concurrency(2)
        .bind(broker.clone(), move |n: usize| {
          let attempts = attempts.clone();
          async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
              return Err::<usize, UnitError>("even numbers are rejected".into());
            }
            Ok(n)
          }
        }),
    )
  };

  for n in 0..10usize {
    task.submit(n).await.unwrap();
  }

  let consumer = {
    let task = task.clone();
    tokio::spawn(async move { task.consume_with_timeout(Duration::from_millis(50)).await })
  };

  wait_for_count(&attempts, 10, Duration::from_secs(5)).await;
  task.stop();
  consumer.await.unwrap().unwrap();

  // Failures are logged and discarded; every payload was attempted once.
  assert_eq!(attempts.load(Ordering::SeqCst), 10);
  assert_eq!(task.queue_len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_structured_serializer_round() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let invocations = Arc::new(AtomicUsize::new(0));

  let task = {
    let invocations = invocations.clone();
    Arc::new(
      TaskBuilder::new("structured")
        .max_concurrency(2)
        .serializer(Serializer::Structured)
        .bind(broker.clone(), move |words: Vec<String>| {
          let invocations = invocations.clone();
          async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<usize, UnitError>(words.len())
          }
        }),
    )
  };

  task.submit(vec!["a".to_string(), "b".to_string()]).await.unwrap();

  // The wire format is plain JSON, inspectable by anything.
  let raw = broker.pop("structured", Duration::from_millis(50)).await.unwrap().unwrap();
  assert_eq!(raw, br#"["a","b"]"#.to_vec());
  broker.push("structured", raw).await.unwrap();

  let consumer = {
    let task = task.clone();
    tokio::spawn(async move { task.consume_with_timeout(Duration::from_millis(50)).await })
  };
  wait_for_count(&invocations, 1, Duration::from_secs(5)).await;
  task.stop();
  consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_clear_queue_purges_pending_records() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let invocations = Arc::new(AtomicUsize::new(0));
  let sum = Arc::new(AtomicUsize::new(0));
  let task = adder_task("purge", broker, invocations, sum);

  for _ in 0..5 {
    task.submit((1, 1)).await.unwrap();
  }
  assert_eq!(task.queue_len().await.unwrap(), 5);
  task.clear_queue().await.unwrap();
  assert_eq!(task.queue_len().await.unwrap(), 0);
  task.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_consume_fans_out_over_queues() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let add_invocations = Arc::new(AtomicUsize::new(0));
  let add_sum = Arc::new(AtomicUsize::new(0));
  let mul_invocations = Arc::new(AtomicUsize::new(0));

  let add_task = adder_task("batch_add", broker.clone(), add_invocations.clone(), add_sum.clone());
  let mul_task = {
    let mul_invocations = mul_invocations.clone();
    TaskBuilder::new("batch_mul")
      .max_concurrency(2)
      .poll_timeout(Duration::from_secs(1))
      .bind(broker.clone(), move |(a, b): (usize, usize)| {
        let mul_invocations = mul_invocations.clone();
        async move {
          mul_invocations.fetch_add(1, Ordering::SeqCst);
          Ok::<usize, UnitError>(a * b)
        }
      })
  };

  for i in 0..20usize {
    add_task.submit((i, 1)).await.unwrap();
  }
  for i in 0..10usize {
    mul_task.submit((i, 2)).await.unwrap();
  }

  let add_task = Arc::new(add_task);
  let mul_task = Arc::new(mul_task);
  let consumers = {
    let add_task = add_task.clone();
    let mul_task = mul_task.clone();
    tokio::spawn(async move { batch_consume(&[add_task.as_ref() as &dyn ConsumeTask, mul_task.as_ref()]).await })
  };

  wait_for_count(&add_invocations, 20, Duration::from_secs(5)).await;
  wait_for_count(&mul_invocations, 10, Duration::from_secs(5)).await;
  add_task.stop();
  mul_task.stop();
  consumers.await.unwrap();

  assert_eq!(add_task.queue_len().await.unwrap(), 0);
  assert_eq!(mul_task.queue_len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consumer_can_be_stopped_and_restarted() {
  setup_tracing_for_test();
  let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
  let invocations = Arc::new(AtomicUsize::new(0));
  let sum = Arc::new(AtomicUsize::new(0));
  let task = Arc::new(adder_task("restart", broker, invocations.clone(), sum));

  task.submit((1, 1)).await.unwrap();
  let consumer = {
    let task = task.clone();
    tokio::spawn(async move { task.consume_with_timeout(Duration::from_millis(50)).await })
  };
  wait_for_count(&invocations, 1, Duration::from_secs(5)).await;
  task.stop();
  consumer.await.unwrap().unwrap();

  task.submit((2, 2)).await.unwrap();
  let consumer = {
    let task = task.clone();
    tokio::spawn(async move { task.consume_with_timeout(Duration::from_millis(50)).await })
  };
  wait_for_count(&invocations, 2, Duration::from_secs(5)).await;
  task.stop();
  consumer.await.unwrap().unwrap();
}
