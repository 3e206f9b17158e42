//! Counting store contract.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a counting store.
///
/// These are never a rate-limit verdict: callers must surface them as failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counting store unavailable: {0}")]
    Unavailable(String),
    #[error("counting store timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected reply from counting store: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Snapshot of a window after a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Whether the attempted point was recorded
    pub admitted: bool,
    /// Points consumed in the window, including the attempt if admitted
    pub points_consumed: u64,
    /// Time left until the store expires the window
    pub expires_in: Duration,
}

/// A shared counter backend with an atomic increment-with-expiry primitive.
///
/// Every process consults the same store; implementations must not cache counts.
#[async_trait]
pub trait CountingStore: Send + Sync {
    /// Atomically record one point against `key` if it fits within `capacity`.
    ///
    /// An absent or expired key starts a fresh window of length `window`.
    /// A point that does not fit is never written.
    async fn consume(
        &self,
        key: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError>;

    /// Read the points consumed in the live window for `key`, if any.
    async fn points(&self, key: &str) -> Result<Option<u64>, StoreError>;
}
