//! Error types for the Spillway service.

use thiserror::Error;

use crate::queue::QueueError;
use crate::ratelimit::StoreError;

/// Main error type for Spillway operations outside the admission path.
#[derive(Error, Debug)]
pub enum SpillwayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counting store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Overflow queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for SpillwayError {
    fn from(err: ::config::ConfigError) -> Self {
        SpillwayError::Config(err.to_string())
    }
}

/// Result type alias for Spillway operations.
pub type Result<T> = std::result::Result<T, SpillwayError>;

/// Errors surfaced synchronously by the admission gate.
///
/// A rate-limit rejection is not an error: it becomes a deferral.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The request carried no usable client identity.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A limiter could not reach the counting store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The deferred task did not land in the overflow queue.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
