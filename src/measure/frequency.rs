//! Frequency measurement on top of the windowed counter.

use std::ops::Deref;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

use super::counter::WindowedCounter;

/// Counts beats and reports them as events per second over the window.
#[derive(Debug)]
pub struct RateMeasure<C: Clock = SystemClock> {
    counter: WindowedCounter<C>,
}

impl RateMeasure {
    /// Create a rate measure with `buffer_size` slots over `window_ms`.
    pub fn new(buffer_size: u32, window_ms: i64) -> Result<Self> {
        Ok(Self {
            counter: WindowedCounter::new(buffer_size, window_ms)?,
        })
    }
}

impl<C: Clock> RateMeasure<C> {
    /// Create a rate measure that reads time from `clock`.
    pub fn with_clock(buffer_size: u32, window_ms: i64, clock: C) -> Result<Self> {
        Ok(Self {
            counter: WindowedCounter::with_clock(buffer_size, window_ms, clock)?,
        })
    }

    /// Average frequency over the window, in Hz.
    ///
    /// Returns `None` if nothing has been counted within the window.
    pub fn frequency(&self) -> Option<f64> {
        let count = self.counter.current_count()?;
        Some(count as f64 * 1000.0 / self.counter.window_length() as f64)
    }

    /// Average frequency formatted for humans, e.g. `12.50 Hz`.
    pub fn readable_frequency(&self) -> String {
        format_frequency(self.frequency())
    }
}

impl<C: Clock> Deref for RateMeasure<C> {
    type Target = WindowedCounter<C>;

    fn deref(&self) -> &Self::Target {
        &self.counter
    }
}

/// Format a frequency in Hz with a fitting unit and two decimals.
pub fn format_frequency(frequency: Option<f64>) -> String {
    match frequency {
        None => "N/A".to_string(),
        Some(hz) if hz < 1.0 => format!("{:.2} mHz", hz * 1000.0),
        Some(hz) if hz < 1_000.0 => format!("{:.2} Hz", hz),
        Some(hz) if hz < 1_000_000.0 => format!("{:.2} kHz", hz / 1_000.0),
        Some(hz) => format!("{:.2} MHz", hz / 1_000_000.0),
    }
}
