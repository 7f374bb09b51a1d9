//! Work units that a rate limiter can execute.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one [`RateLimiter`](super::RateLimiter) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimiterId(u64);

impl LimiterId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LimiterId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LimiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "limiter-{}", self.0)
    }
}

/// A mutable action owned and executed by a rate limiter.
///
/// Any `FnMut() + Send + 'static` closure is a task.
pub trait Task: Send + 'static {
    /// Execute the task once.
    fn run(&mut self);

    /// The limiter this task forwards requests to, if it is a limiter handle.
    fn forwards_to(&self) -> Option<LimiterId> {
        None
    }
}

impl<F> Task for F
where
    F: FnMut() + Send + 'static,
{
    fn run(&mut self) {
        self()
    }
}
