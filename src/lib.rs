//! Bounded, back-pressured Tokio concurrency pools, plus a minimal
//! distributed task queue that uses an external key/value store as its
//! broker.
//!
//! [`BoundedPool`] converts an unbounded producer loop into a rate that
//! matches consumer capacity: at most `max_concurrency` units run at
//! once, at most `max_queue_size` wait in staging, and producers block
//! when the staging buffer is full. [`DirectPool`] trades the staging
//! buffer for a hard in-flight bound enforced at submission time.
//! [`NamedTask`] projects the same contract across processes through a
//! Redis-compatible [`Broker`].

mod broker;
mod codec;
mod direct;
mod error;
mod pool;
mod queue;
mod registry;
mod slot;
mod task;

pub use broker::{Broker, BrokerError, MemoryBroker, RedisBroker};
pub use codec::{CodecError, Serializer};
pub use direct::DirectPool;
pub use error::{PoolError, UnitError};
pub use pool::BoundedPool;
pub use queue::WorkUnit;
pub use registry::shutdown_all;
pub use slot::ResultSlot;
pub use task::{batch_consume, ConsumeTask, NamedTask, TaskBuilder, TaskConfig, TaskError};
