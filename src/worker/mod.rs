//! Deferred execution of queued work.

mod deferred;
mod handler;
mod retry;

pub use deferred::{DeferredWorker, TaskOutcome};
pub use handler::{CompletionLogger, Deduplicate, TaskFailure, TaskHandler};
pub use retry::RetryPolicy;
