//! Deferred worker: drains the overflow queue outside any rate-limit window.

use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use super::handler::{TaskFailure, TaskHandler};
use super::retry::RetryPolicy;
use crate::config::WorkerConfig;
use crate::queue::{deliveries, Delivery, OverflowQueue, QueueError};

/// Default upper bound on a single ack / retry / dead-letter call.
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Executed and acknowledged
    Completed,
    /// Failed transiently and was rescheduled
    Retrying { attempt: u32, delay: Duration },
    /// Failed for good and was moved to the dead-letter set
    DeadLettered { reason: String },
}

/// Consumes deferred tasks with bounded concurrency.
///
/// The worker never consults the window limiters: deferred work is
/// executable once it is delivered.
pub struct DeferredWorker<Q: ?Sized, H: ?Sized> {
    queue: Arc<Q>,
    handler: Arc<H>,
    policy: RetryPolicy,
    concurrency: usize,
    execution_timeout: Duration,
    reserve_wait: Duration,
    queue_timeout: Duration,
    stall_timeout: Duration,
    stall_check_interval: Duration,
}

impl<Q, H> DeferredWorker<Q, H>
where
    Q: OverflowQueue + ?Sized + 'static,
    H: TaskHandler + ?Sized,
{
    pub fn new(queue: Arc<Q>, handler: Arc<H>, config: &WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            policy: RetryPolicy::from_config(config),
            concurrency: config.concurrency.max(1),
            execution_timeout: config.execution_timeout(),
            reserve_wait: config.reserve_wait(),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            stall_timeout: config.stall_timeout(),
            stall_check_interval: config.stall_check_interval(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound every ack, retry and dead-letter call.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Consume deliveries until `shutdown` resolves.
    ///
    /// Alongside consumption, reservations older than the stall timeout are
    /// periodically returned to the queue, starting immediately. No new work
    /// is pulled after shutdown; tasks already executing finish.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            concurrency = self.concurrency,
            stall_timeout = ?self.stall_timeout,
            "Deferred worker started"
        );
        let shutdown = shutdown.shared();

        let consume = deliveries(self.queue.clone(), self.reserve_wait)
            .take_until(shutdown.clone())
            .for_each_concurrent(self.concurrency, |item| async move {
                match item {
                    Ok(delivery) => {
                        if let Err(e) = self.process(delivery).await {
                            error!(error = %e, "Failed to settle task with the queue");
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to reserve task"),
                }
            })
            .boxed();

        let sweep = async {
            let mut ticker = tokio::time::interval(self.stall_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are logged; the next tick tries again.
                let _ = self.requeue_stalled().await;
            }
        };

        futures::future::join(consume, async {
            tokio::select! {
                _ = shutdown => {}
                _ = sweep => {}
            }
        })
        .await;

        info!("Deferred worker stopped");
    }

    /// Return reservations older than the stall timeout to the queue.
    pub async fn requeue_stalled(&self) -> Result<usize, QueueError> {
        let requeued = self
            .bounded(self.queue.requeue_stalled(self.stall_timeout))
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to requeue stalled tasks"))?;
        if requeued > 0 {
            warn!(requeued, "Requeued tasks abandoned by their consumer");
        }
        Ok(requeued)
    }

    /// Reserve and process at most one task, waiting up to `wait` for it.
    pub async fn process_next(&self, wait: Duration) -> Result<Option<TaskOutcome>, QueueError> {
        match self.queue.reserve(wait).await? {
            Some(delivery) => self.process(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Execute one delivery and settle it with the queue.
    ///
    /// An error means the queue could not be told the outcome; the task
    /// stays in flight and is redelivered after recovery.
    #[instrument(skip(self, delivery), fields(task_id = %delivery.task().id, client = %delivery.task().client))]
    pub async fn process(&self, delivery: Delivery) -> Result<TaskOutcome, QueueError> {
        let task = delivery.task();
        let attempt = task.attempts + 1;

        let result = match tokio::time::timeout(self.execution_timeout, self.handler.execute(task)).await {
            Ok(result) => result,
            Err(_) => Err(TaskFailure::Transient(format!(
                "execution timed out after {:?}",
                self.execution_timeout
            ))),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.bounded(self.queue.ack(&delivery)).await {
                    // Completion already happened; a redelivery hits an idempotent handler.
                    warn!(error = %e, "Failed to acknowledge completed task");
                }
                Ok(TaskOutcome::Completed)
            }
            Err(TaskFailure::Transient(reason)) if self.policy.should_retry(attempt) => {
                let delay = self.policy.backoff(attempt);
                self.bounded(self.queue.retry(&delivery, delay)).await?;
                warn!(attempt, ?delay, reason = %reason, "Task failed transiently, retrying");
                Ok(TaskOutcome::Retrying { attempt, delay })
            }
            Err(failure) => {
                let reason = match &failure {
                    TaskFailure::Transient(reason) => {
                        format!("gave up after {} attempts: {}", attempt, reason)
                    }
                    TaskFailure::Permanent(reason) => reason.clone(),
                };
                self.bounded(self.queue.dead_letter(&delivery, &reason)).await?;
                error!(attempt, reason = %reason, "Task dead-lettered");
                Ok(TaskOutcome::DeadLettered { reason })
            }
        }
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        tokio::time::timeout(self.queue_timeout, op)
            .await
            .map_err(|_| QueueError::Timeout(self.queue_timeout))?
    }
}
