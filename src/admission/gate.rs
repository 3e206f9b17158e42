//! Admission gate: burst and sustained limiters composed with overflow deferral.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::config::{LimitsConfig, SpillwayConfig};
use crate::error::AdmissionError;
use crate::queue::{DeferredTask, OverflowQueue, QueueError};
use crate::ratelimit::{
    ClientIdentity, ConsumptionResult, CountingStore, WindowKind, WindowLimiter,
};

/// Default upper bound on a single enqueue.
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// The gate's verdict for a valid request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Within both budgets; the caller may run the work now.
    Accepted,
    /// Over budget; the work was durably queued for later execution.
    Deferred {
        /// Hint for the caller, in whole seconds, at least 1
        retry_after_secs: u64,
        /// Id of the queued task
        task_id: Uuid,
    },
}

/// Convert a limiter wait into a `Retry-After` hint.
///
/// Rounds to the nearest second, never below one.
pub fn retry_after_secs(wait_millis: u64) -> u64 {
    ((wait_millis + 500) / 1000).max(1)
}

/// Decides whether a client's request runs now or is deferred.
///
/// The burst window is always consulted first. If it rejects, that verdict
/// binds and the sustained window is left untouched.
pub struct AdmissionGate<S: ?Sized, Q: ?Sized> {
    burst: WindowLimiter<S>,
    sustained: WindowLimiter<S>,
    queue: Arc<Q>,
    queue_timeout: Duration,
}

impl<S, Q> AdmissionGate<S, Q>
where
    S: CountingStore + ?Sized,
    Q: OverflowQueue + ?Sized,
{
    /// Create a gate enforcing `limits` with default timeouts and no key prefix.
    pub fn new(store: Arc<S>, queue: Arc<Q>, limits: &LimitsConfig) -> Self {
        Self {
            burst: WindowLimiter::new(store.clone(), WindowKind::Burst, limits.burst),
            sustained: WindowLimiter::new(store, WindowKind::Sustained, limits.sustained),
            queue,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }

    /// Create a gate from the service configuration.
    pub fn from_config(store: Arc<S>, queue: Arc<Q>, config: &SpillwayConfig) -> Self {
        let store_timeout = config.store.timeout();
        let prefix = &config.store.key_prefix;
        Self {
            burst: WindowLimiter::new(store.clone(), WindowKind::Burst, config.limits.burst)
                .with_key_prefix(prefix.clone())
                .with_timeout(store_timeout),
            sustained: WindowLimiter::new(store, WindowKind::Sustained, config.limits.sustained)
                .with_key_prefix(prefix.clone())
                .with_timeout(store_timeout),
            queue,
            queue_timeout: config.queue.timeout(),
        }
    }

    /// Bound every store call made by both limiters.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.burst = self.burst.with_timeout(timeout);
        self.sustained = self.sustained.with_timeout(timeout);
        self
    }

    /// Bound the enqueue made on deferral.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Get the limiter for a window.
    pub fn limiter(&self, kind: WindowKind) -> &WindowLimiter<S> {
        match kind {
            WindowKind::Burst => &self.burst,
            WindowKind::Sustained => &self.sustained,
        }
    }

    /// Admit, defer, or fail a request from `client`.
    ///
    /// `Deferred` is only returned once the task is confirmed in the queue.
    /// A store or queue failure is an error and never enqueues anything.
    #[instrument(skip(self))]
    pub async fn admit(&self, client: &str) -> Result<AdmissionDecision, AdmissionError> {
        let client = ClientIdentity::parse(client).inspect_err(|_| {
            warn!("Rejecting request without client identity");
        })?;

        for limiter in [&self.burst, &self.sustained] {
            let result = limiter.consume(&client).await.inspect_err(|e| {
                error!(client = %client, window = %limiter.kind(), error = %e, "Rate limiter store error");
            })?;

            if let ConsumptionResult::Rejected {
                wait_millis,
                points_consumed,
            } = result
            {
                debug!(
                    client = %client,
                    window = %limiter.kind(),
                    points = points_consumed,
                    "Window rejected request"
                );
                return self.defer(client, limiter.kind(), wait_millis).await;
            }
        }

        debug!(client = %client, "Request admitted");
        Ok(AdmissionDecision::Accepted)
    }

    async fn defer(
        &self,
        client: ClientIdentity,
        window: WindowKind,
        wait_millis: u64,
    ) -> Result<AdmissionDecision, AdmissionError> {
        let retry_after_secs = retry_after_secs(wait_millis);
        let task = DeferredTask::new(client);

        tokio::time::timeout(self.queue_timeout, self.queue.enqueue(&task))
            .await
            .map_err(|_| QueueError::Timeout(self.queue_timeout))
            .and_then(|result| result)
            .inspect_err(|e| {
                error!(
                    client = %task.client,
                    task_id = %task.id,
                    error = %e,
                    "Failed to enqueue deferred task"
                );
            })?;

        warn!(
            client = %task.client,
            window = %window,
            task_id = %task.id,
            retry_after_secs,
            "Rate limit exceeded, task queued"
        );

        Ok(AdmissionDecision::Deferred {
            retry_after_secs,
            task_id: task.id,
        })
    }
}
