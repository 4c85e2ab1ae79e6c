//! Sliding-window admission control
//!
//! Bounds the rate at which tasks *start*, not how many run at once. Callers
//! wait in a FIFO queue until the trailing window has room; an admitted task
//! runs on the caller's own task while the limiter keeps admitting others.

pub mod error;
pub mod limiter;

pub use error::{Error, Result};
pub use limiter::{QueueWarning, RateLimiter, RateLimiterOptions};
