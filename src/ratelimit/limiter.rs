//! Window limiter: one fixed-window budget checked against the counting store.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::identity::ClientIdentity;
use super::store::{CountingStore, StoreError};
use super::window::{ConsumptionResult, WindowKind, WindowSpec};

/// Default upper bound on a single store round trip.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Enforces one window's budget for every client.
///
/// The limiter keeps no counts of its own; every attempt is a visible
/// mutation against the shared store.
pub struct WindowLimiter<S: ?Sized> {
    store: Arc<S>,
    kind: WindowKind,
    spec: WindowSpec,
    key_prefix: String,
    timeout: Duration,
}

impl<S: CountingStore + ?Sized> WindowLimiter<S> {
    /// Create a limiter for `kind` with the given budget.
    pub fn new(store: Arc<S>, kind: WindowKind, spec: WindowSpec) -> Self {
        Self {
            store,
            kind,
            spec,
            key_prefix: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Namespace every key this limiter writes.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bound every store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    /// Attempt to consume one point of this window for `client`.
    ///
    /// A store outage or timeout is an error, never a rejection.
    pub async fn consume(&self, client: &ClientIdentity) -> Result<ConsumptionResult, StoreError> {
        let key = client.window_key(&self.key_prefix, self.kind);

        trace!(key = %key, window = %self.kind, "Consuming window point");

        let snapshot = tokio::time::timeout(
            self.timeout,
            self.store
                .consume(&key, self.spec.capacity, self.spec.duration()),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.timeout))
        .and_then(|result| result)
        .inspect_err(|e| {
            warn!(key = %key, window = %self.kind, error = %e, "Counting store call failed");
        })?;

        if snapshot.admitted {
            return Ok(ConsumptionResult::Allowed);
        }

        let wait_millis = (snapshot.expires_in.as_millis() as u64).max(1);
        debug!(
            key = %key,
            window = %self.kind,
            points = snapshot.points_consumed,
            capacity = self.spec.capacity,
            wait_millis,
            "Window budget exhausted"
        );

        Ok(ConsumptionResult::Rejected {
            wait_millis,
            points_consumed: snapshot.points_consumed,
        })
    }

    /// Read the points consumed by `client` in the live window.
    pub async fn points(&self, client: &ClientIdentity) -> Result<u64, StoreError> {
        let key = client.window_key(&self.key_prefix, self.kind);
        tokio::time::timeout(self.timeout, self.store.points(&key))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map(|points| points.unwrap_or(0))
    }
}
