//! Window kinds and their fixed budgets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The two accounting windows every client is held to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Short, low-capacity window guarding against spikes
    Burst,
    /// Long window guarding average throughput
    Sustained,
}

impl WindowKind {
    /// Key namespace for this window in the counting store.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            WindowKind::Burst => "rps",
            WindowKind::Sustained => "rpm",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Burst => "burst",
            WindowKind::Sustained => "sustained",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget for a single window: `capacity` points per `duration_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Points available per window
    pub capacity: u64,
    /// Window length in seconds
    pub duration_secs: u64,
}

impl WindowSpec {
    pub const fn new(capacity: u64, duration_secs: u64) -> Self {
        Self {
            capacity,
            duration_secs,
        }
    }

    /// Get the duration of this window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Outcome of a single consumption attempt against one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionResult {
    /// The point fit within the window's budget and was recorded.
    Allowed,
    /// The window is exhausted; nothing was recorded.
    Rejected {
        /// Time until the window resets, never zero
        wait_millis: u64,
        /// Points already consumed in the current window
        points_consumed: u64,
    },
}

impl ConsumptionResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConsumptionResult::Allowed)
    }
}
