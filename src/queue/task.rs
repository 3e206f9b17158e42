//! Deferred task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ratelimit::ClientIdentity;

/// A unit of work rerouted from the synchronous path after a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredTask {
    /// Unique task id, used for log correlation
    pub id: Uuid,
    /// Principal the work runs on behalf of
    pub client: ClientIdentity,
    /// When the gate enqueued the task
    pub enqueued_at: DateTime<Utc>,
    /// Executions already attempted and failed transiently
    #[serde(default)]
    pub attempts: u32,
}

impl DeferredTask {
    pub fn new(client: ClientIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// A task handed to one consumer. It stays in the queue until acknowledged
/// or dead-lettered.
#[derive(Debug, Clone)]
pub struct Delivery {
    task: DeferredTask,
    receipt: String,
}

impl Delivery {
    pub fn new(task: DeferredTask, receipt: impl Into<String>) -> Self {
        Self {
            task,
            receipt: receipt.into(),
        }
    }

    pub fn task(&self) -> &DeferredTask {
        &self.task
    }

    /// Backend-specific handle identifying this delivery.
    pub fn receipt(&self) -> &str {
        &self.receipt
    }

    pub fn into_task(self) -> DeferredTask {
        self.task
    }
}

/// Terminal record for a task that will not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: DeferredTask,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: DeferredTask, reason: impl Into<String>) -> Self {
        Self {
            task,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}
