//! Overflow queue for work deferred by the admission gate.

mod backend;
mod memory;
mod redis_queue;
mod task;

pub use backend::{deliveries, OverflowQueue, QueueError, ERROR_BACKOFF};
pub use memory::InMemoryQueue;
pub use redis_queue::{RedisQueue, RedisQueueConfig};
pub use task::{DeadLetter, DeferredTask, Delivery};
