//! Windowed measurement of event counts, frequencies and bitrates.

mod bitrate;
mod counter;
mod frequency;

pub use bitrate::{format_bitrate, ThroughputMeasure};
pub use counter::WindowedCounter;
pub use frequency::{format_frequency, RateMeasure};
