//! Ratewatch - windowed rate measurement and task throttling
//!
//! This crate measures event rates and throughput over a sliding time
//! window with a fixed-size ring of probe slots, and throttles a task to at
//! most one execution per minimum interval, coalescing excess requests into
//! a single deferred run.

pub mod clock;
pub mod config;
pub mod error;
pub mod measure;
pub mod throttle;

pub use error::{RatewatchError, Result};
pub use measure::{RateMeasure, ThroughputMeasure, WindowedCounter};
pub use throttle::{RateLimiter, RequestHandle, Task, Throttle};
