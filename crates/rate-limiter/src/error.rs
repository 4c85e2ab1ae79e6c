//! Error types for admission control

use std::time::Duration;

/// Why a task was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rate limiter is closed")]
    Closed,

    #[error("rate limiter queue limit reached ({limit})")]
    QueueFull { limit: usize },

    #[error("rate limiter wait time exceeded ({}ms)", .limit.as_millis())]
    WaitExceeded { limit: Duration },
}

/// Result alias for limiter operations.
pub type Result<T> = std::result::Result<T, Error>;
