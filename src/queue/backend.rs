//! Overflow queue contract.

use async_trait::async_trait;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::task::{DeadLetter, DeferredTask, Delivery};

/// Errors raised by an overflow queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
    #[error("queue operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed task payload: {0}")]
    Serialization(String),
    #[error("unknown delivery receipt: {0}")]
    UnknownDelivery(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// A durable, at-least-once task queue.
///
/// A reserved task stays owned by the queue until it is acknowledged or
/// dead-lettered. Tasks stranded by a crashed consumer come back through
/// [`OverflowQueue::recover`].
#[async_trait]
pub trait OverflowQueue: Send + Sync {
    /// Append a task. `Ok` means the task is durably stored.
    async fn enqueue(&self, task: &DeferredTask) -> Result<(), QueueError>;

    /// Take the next visible task, waiting up to `wait` for one to appear.
    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a completed task.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Make a task visible again after `delay`, counting one more attempt.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Move a task to the dead-letter set.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Return every in-flight task to the pending list. Returns how many moved.
    ///
    /// Only safe when no other consumer is running.
    async fn recover(&self) -> Result<usize, QueueError>;

    /// Return tasks reserved more than `older_than` ago to the pending list.
    ///
    /// The stale delivery's receipt stops being valid: settling it afterwards
    /// fails with [`QueueError::UnknownDelivery`].
    async fn requeue_stalled(&self, older_than: Duration) -> Result<usize, QueueError>;

    /// List dead-lettered tasks.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Number of tasks currently visible to consumers.
    async fn pending(&self) -> Result<usize, QueueError>;
}

/// Pause before polling again after a backend error.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A lazy, endless sequence of deliveries from `queue`.
///
/// Polling suspends while the queue is empty. Backend errors are yielded
/// rather than ending the stream, and the stream itself waits
/// [`ERROR_BACKOFF`] before the next reserve.
pub fn deliveries<Q>(queue: Arc<Q>, wait: Duration) -> impl Stream<Item = Result<Delivery, QueueError>> + Send
where
    Q: OverflowQueue + ?Sized + 'static,
{
    futures::stream::unfold((queue, false), move |(queue, failed)| async move {
        if failed {
            tokio::time::sleep(ERROR_BACKOFF).await;
        }
        loop {
            match queue.reserve(wait).await {
                Ok(Some(delivery)) => return Some((Ok(delivery), (queue, false))),
                Ok(None) => continue,
                Err(e) => return Some((Err(e), (queue, true))),
            }
        }
    })
}
