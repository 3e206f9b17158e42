//! In-process overflow queue.
//!
//! Durable only for the life of the process. Intended for tests and for
//! embedding the gate and worker in a single binary.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{OverflowQueue, QueueError};
use super::task::{DeadLetter, DeferredTask, Delivery};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<DeferredTask>,
    delayed: Vec<(Instant, DeferredTask)>,
    in_flight: BTreeMap<u64, (Instant, DeferredTask)>,
    dead: Vec<DeadLetter>,
    next_receipt: u64,
}

impl QueueState {
    /// Move delayed tasks whose delay has elapsed into the pending list.
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, task) = self.delayed.swap_remove(i);
                self.pending.push_back(task);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn take_in_flight(&mut self, delivery: &Delivery) -> Result<DeferredTask, QueueError> {
        delivery
            .receipt()
            .parse::<u64>()
            .ok()
            .and_then(|receipt| self.in_flight.remove(&receipt))
            .map(|(_, task)| task)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.receipt().to_string()))
    }
}

/// An overflow queue held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks reserved but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of tasks waiting out a retry delay.
    pub fn delayed(&self) -> usize {
        self.state.lock().delayed.len()
    }
}

#[async_trait]
impl OverflowQueue for InMemoryQueue {
    async fn enqueue(&self, task: &DeferredTask) -> Result<(), QueueError> {
        self.state.lock().pending.push_back(task.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let next_due = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());

                if let Some(task) = state.pending.pop_front() {
                    let receipt = state.next_receipt;
                    state.next_receipt += 1;
                    state.in_flight.insert(receipt, (Instant::now(), task.clone()));
                    return Ok(Some(Delivery::new(task, receipt.to_string())));
                }
                state.next_due()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().take_in_flight(delivery)?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let mut task = state.take_in_flight(delivery)?;
            task.attempts += 1;
            state.delayed.push((Instant::now() + delay, task));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let task = state.take_in_flight(delivery)?;
        state.dead.push(DeadLetter::new(task, reason));
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.state.lock();
            let stranded = std::mem::take(&mut state.in_flight);
            let count = stranded.len();
            // Oldest receipt goes back to the front.
            for (_, (_, task)) in stranded.into_iter().rev() {
                state.pending.push_front(task);
            }
            count
        };

        if recovered > 0 {
            debug!(recovered, "Returned in-flight tasks to the pending list");
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn requeue_stalled(&self, older_than: Duration) -> Result<usize, QueueError> {
        let requeued = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let stalled: Vec<u64> = state
                .in_flight
                .iter()
                .filter(|(_, (reserved_at, _))| now.duration_since(*reserved_at) > older_than)
                .map(|(receipt, _)| *receipt)
                .collect();
            for receipt in stalled.iter().rev() {
                if let Some((_, task)) = state.in_flight.remove(receipt) {
                    state.pending.push_front(task);
                }
            }
            stalled.len()
        };

        if requeued > 0 {
            debug!(requeued, "Requeued stalled tasks");
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state.lock().dead.clone())
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::backend::deliveries;
    use crate::ratelimit::ClientIdentity;
    use futures::StreamExt;
    use std::sync::Arc;

    fn task(id: &str) -> DeferredTask {
        DeferredTask::new(ClientIdentity::parse(id).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_delivery() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&task("a")).await.unwrap();
        queue.enqueue(&task("b")).await.unwrap();

        let first = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.task().client.as_str(), "a");
        assert_eq!(second.task().client.as_str(), "b");
        assert_eq!(queue.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_times_out_when_empty() {
        let queue = InMemoryQueue::new();
        let start = Instant::now();
        assert!(queue.reserve(Duration::from_secs(2)).await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.reserve(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(&task("late")).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.task().client.as_str(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_task() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&task("a")).await.unwrap();
        let delivery = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert!(matches!(
            queue.ack(&delivery).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_delayed_and_counts_attempts() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&task("a")).await.unwrap();
        let delivery = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        queue.retry(&delivery, Duration::from_secs(5)).await.unwrap();
        assert_eq!(queue.delayed(), 1);
        assert!(queue.reserve(Duration::from_secs(1)).await.unwrap().is_none());

        let redelivered = queue.reserve(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(redelivered.task().id, delivery.task().id);
        assert_eq!(redelivered.task().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_is_observable() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&task("a")).await.unwrap();
        let delivery = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        queue.dead_letter(&delivery, "boom").await.unwrap();
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "boom");
        assert_eq!(dead[0].task.id, delivery.task().id);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_redelivers_stranded_tasks() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&task("a")).await.unwrap();
        queue.enqueue(&task("b")).await.unwrap();
        queue.enqueue(&task("c")).await.unwrap();
        let first = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let _second = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        // Simulated crash: neither delivery is acknowledged.
        assert_eq!(queue.recover().await.unwrap(), 2);
        assert_eq!(queue.in_flight(), 0);

        let order: Vec<String> = {
            let mut order = Vec::new();
            while let Some(d) = queue.reserve(Duration::ZERO).await.unwrap() {
                order.push(d.task().client.to_string());
            }
            order
        };
        assert_eq!(order, vec!["a", "b", "c"]);

        // A stale receipt from before the crash is no longer valid.
        assert!(queue.ack(&first).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_stalled_only_takes_old_reservations() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&task("old")).await.unwrap();
        queue.enqueue(&task("young")).await.unwrap();
        let old = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        let young = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;

        assert_eq!(queue.requeue_stalled(Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.pending().await.unwrap(), 1);

        // The stalled receipt is dead; the young one still settles.
        assert!(matches!(
            queue.retry(&old, Duration::ZERO).await,
            Err(QueueError::UnknownDelivery(_))
        ));
        queue.ack(&young).await.unwrap();

        let again = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.task().id, old.task().id);
        assert_eq!(again.task().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_stream_suspends_until_work_arrives() {
        let queue = Arc::new(InMemoryQueue::new());
        let mut stream = Box::pin(deliveries(queue.clone(), Duration::from_millis(100)));

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                queue.enqueue(&task("eventually")).await.unwrap();
            })
        };

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.task().client.as_str(), "eventually");
        producer.await.unwrap();
    }
}
