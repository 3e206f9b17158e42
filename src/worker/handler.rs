//! The unit of work a deferred task stands for.

use async_trait::async_trait;
use chrono::{Local, Utc};
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::DeferredTask;

/// Why an execution failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    /// Worth retrying after a backoff
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying will not help; the task is dead-lettered
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Executes the work behind a deferred task.
///
/// Implementations must be idempotent per task id: the queue delivers at
/// least once, so the same task can arrive more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &DeferredTask) -> Result<(), TaskFailure>;
}

/// The default unit of work: record that the client's task ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionLogger;

#[async_trait]
impl TaskHandler for CompletionLogger {
    async fn execute(&self, task: &DeferredTask) -> Result<(), TaskFailure> {
        info!(
            client = %task.client,
            task_id = %task.id,
            "Task completed for client {} at {}",
            task.client,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }
}

/// Skips tasks that already completed in this process.
///
/// Completed ids are remembered for `retention`, which should cover the
/// longest plausible redelivery delay.
#[derive(Debug)]
pub struct Deduplicate<H> {
    inner: H,
    completed: DashMap<Uuid, chrono::DateTime<Utc>>,
    retention: Duration,
}

impl<H: TaskHandler> Deduplicate<H> {
    pub fn new(inner: H, retention: Duration) -> Self {
        Self {
            inner,
            completed: DashMap::new(),
            retention,
        }
    }

    /// Number of completed ids currently remembered.
    pub fn remembered(&self) -> usize {
        self.completed.len()
    }

    fn purge(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        if let Some(cutoff) = Utc::now().checked_sub_signed(retention) {
            self.completed.retain(|_, done_at| *done_at > cutoff);
        }
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for Deduplicate<H> {
    async fn execute(&self, task: &DeferredTask) -> Result<(), TaskFailure> {
        self.purge();
        if self.completed.contains_key(&task.id) {
            debug!(task_id = %task.id, "Task already completed, skipping redelivery");
            return Ok(());
        }

        self.inner.execute(task).await?;
        self.completed.insert(task.id, Utc::now());
        Ok(())
    }
}
