//! Task throttling with deferred, coalesced execution.

mod limiter;
mod task;
mod timer;

pub use limiter::{RateLimiter, RequestHandle, Throttle, DISABLED};
pub use task::{LimiterId, Task};
