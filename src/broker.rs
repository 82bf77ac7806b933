use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("broker unavailable: {0}")]
  Unavailable(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<redis::RedisError> for BrokerError {
  fn from(error: redis::RedisError) -> Self {
    BrokerError::Unavailable(Box::new(error))
  }
}

/// The queue contract the distributed task layer expects: ordered FIFO
/// push per key, blocking pop with a timeout, a length query, purge,
/// and close.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
  /// Appends a payload to the tail of `queue`.
  async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

  /// Pops from the head of `queue`, suspending up to `wait` before
  /// returning `None`.
  async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, BrokerError>;

  /// Best-effort number of payloads currently in `queue`.
  async fn len(&self, queue: &str) -> Result<usize, BrokerError>;

  /// Removes every payload in `queue`.
  async fn clear(&self, queue: &str) -> Result<(), BrokerError>;

  /// Releases the underlying connection, if any.
  async fn close(&self) -> Result<(), BrokerError>;
}

/// Redis-backed broker: one list per queue key, RPUSH/BLPOP ordering.
///
/// Connection recovery is the connection manager's concern; a dropped
/// connection surfaces here as `Unavailable` only while the manager is
/// re-establishing it.
pub struct RedisBroker {
  connection: ConnectionManager,
}

impl RedisBroker {
  pub async fn connect(url: &str) -> Result<Self, BrokerError> {
    let client = redis::Client::open(url)?;
    let connection = ConnectionManager::new(client).await?;
    info!(url, "Connected to Redis broker.");
    Ok(Self { connection })
  }
}

#[async_trait]
impl Broker for RedisBroker {
  async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
    let mut connection = self.connection.clone();
    let _: () = connection.rpush(queue, payload).await?;
    Ok(())
  }

  async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
    let mut connection = self.connection.clone();
    let reply: Option<(String, Vec<u8>)> = connection.blpop(queue, wait.as_secs_f64()).await?;
    Ok(reply.map(|(_key, payload)| payload))
  }

  async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
    let mut connection = self.connection.clone();
    Ok(connection.llen(queue).await?)
  }

  async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
    let mut connection = self.connection.clone();
    let _: () = connection.del(queue).await?;
    debug!(queue, "Queue cleared.");
    Ok(())
  }

  async fn close(&self) -> Result<(), BrokerError> {
    // The connection manager has no explicit teardown; dropping the
    // last clone closes the underlying connection.
    Ok(())
  }
}

/// In-process broker with the same FIFO contract, for tests and
/// single-process runs.
#[derive(Default)]
pub struct MemoryBroker {
  queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
  arrival: Notify,
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
    self
      .queues
      .lock()
      .unwrap()
      .entry(queue.to_string())
      .or_default()
      .push_back(payload);
    self.arrival.notify_waiters();
    Ok(())
  }

  async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
    let deadline = Instant::now() + wait;
    loop {
      // Register for wakeups before checking, so a push between the
      // check and the await cannot be missed.
      let mut arrival = pin!(self.arrival.notified());
      arrival.as_mut().enable();

      if let Some(payload) = self.queues.lock().unwrap().get_mut(queue).and_then(VecDeque::pop_front) {
        return Ok(Some(payload));
      }

      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() || timeout(remaining, arrival).await.is_err() {
        return Ok(None);
      }
    }
  }

  async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
    Ok(self.queues.lock().unwrap().get(queue).map_or(0, VecDeque::len))
  }

  async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
    self.queues.lock().unwrap().remove(queue);
    Ok(())
  }

  async fn close(&self) -> Result<(), BrokerError> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn test_memory_broker_fifo() {
    let broker = MemoryBroker::new();
    broker.push("q", b"a".to_vec()).await.unwrap();
    broker.push("q", b"b".to_vec()).await.unwrap();
    assert_eq!(broker.len("q").await.unwrap(), 2);

    let first = broker.pop("q", Duration::from_millis(10)).await.unwrap();
    assert_eq!(first.as_deref(), Some(b"a".as_slice()));
    let second = broker.pop("q", Duration::from_millis(10)).await.unwrap();
    assert_eq!(second.as_deref(), Some(b"b".as_slice()));
    assert_eq!(broker.len("q").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_memory_broker_pop_times_out_empty() {
    let broker = MemoryBroker::new();
    let popped = broker.pop("empty", Duration::from_millis(20)).await.unwrap();
    assert!(popped.is_none());
  }

  #[tokio::test]
  async fn test_memory_broker_pop_wakes_on_push() {
    let broker = Arc::new(MemoryBroker::new());
    let popper = {
      let broker = broker.clone();
      tokio::spawn(async move { broker.pop("q", Duration::from_secs(5)).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.push("q", b"late".to_vec()).await.unwrap();
    let popped = popper.await.unwrap();
    assert_eq!(popped.as_deref(), Some(b"late".as_slice()));
  }

  #[tokio::test]
  async fn test_memory_broker_clear() {
    let broker = MemoryBroker::new();
    broker.push("q", b"a".to_vec()).await.unwrap();
    broker.clear("q").await.unwrap();
    assert_eq!(broker.len("q").await.unwrap(), 0);
  }
}
