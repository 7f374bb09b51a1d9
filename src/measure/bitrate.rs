//! Throughput measurement in bits per second.

use std::ops::Deref;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

use super::frequency::RateMeasure;

/// Counts transferred bits and reports the bitrate over the window.
#[derive(Debug)]
pub struct ThroughputMeasure<C: Clock = SystemClock> {
    rate: RateMeasure<C>,
}

impl ThroughputMeasure {
    /// Create a throughput measure with `buffer_size` slots over `window_ms`.
    pub fn new(buffer_size: u32, window_ms: i64) -> Result<Self> {
        Ok(Self {
            rate: RateMeasure::new(buffer_size, window_ms)?,
        })
    }
}

impl<C: Clock> ThroughputMeasure<C> {
    /// Create a throughput measure that reads time from `clock`.
    pub fn with_clock(buffer_size: u32, window_ms: i64, clock: C) -> Result<Self> {
        Ok(Self {
            rate: RateMeasure::with_clock(buffer_size, window_ms, clock)?,
        })
    }

    /// Record one bit.
    pub fn count_bit(&self) {
        self.rate.count(1);
    }

    /// Record one byte, i.e. eight bits.
    pub fn count_byte(&self) {
        self.rate.count(8);
    }

    /// Record `bits` bits.
    pub fn count_bits(&self, bits: i64) {
        self.rate.count(bits);
    }

    /// Record `bytes` bytes. The bit count saturates at `i64::MAX`.
    pub fn count_bytes(&self, bytes: i64) {
        self.count_bits(bytes.saturating_mul(8));
    }

    /// Average bitrate over the window in bits per second.
    pub fn bitrate(&self) -> Option<f64> {
        self.rate.frequency()
    }

    /// Average bitrate formatted for humans, e.g. `123.45 kbps`.
    pub fn readable_bitrate(&self) -> String {
        format_bitrate(self.bitrate())
    }
}

impl<C: Clock> Deref for ThroughputMeasure<C> {
    type Target = RateMeasure<C>;

    fn deref(&self) -> &Self::Target {
        &self.rate
    }
}

/// Format a bitrate with a fitting unit and two decimals.
pub fn format_bitrate(bitrate: Option<f64>) -> String {
    match bitrate {
        None => "N/A".to_string(),
        Some(bps) if bps < 1_000.0 => format!("{:.2} bps", bps),
        Some(bps) if bps < 1_000_000.0 => format!("{:.2} kbps", bps / 1_000.0),
        Some(bps) if bps < 1_000_000_000.0 => format!("{:.2} Mbps", bps / 1_000_000.0),
        Some(bps) => format!("{:.2} Gbps", bps / 1_000_000_000.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_bit_and_byte_counting() {
        let measure = ThroughputMeasure::with_clock(10, 1000, ManualClock::new(0)).unwrap();

        measure.count_bit();
        measure.count_byte();
        measure.count_bits(3);
        measure.count_bytes(2);

        assert_eq!(measure.current_count(), Some(1 + 8 + 3 + 16));
        assert_eq!(measure.bitrate(), Some(28.0));
        assert_eq!(measure.readable_bitrate(), "28.00 bps");
    }

    #[test]
    fn test_bitrate_over_longer_window() {
        let measure = ThroughputMeasure::with_clock(4, 4000, ManualClock::new(0)).unwrap();

        measure.count_bytes(500_000);
        // 4 Mbit over 4 seconds.
        assert_eq!(measure.bitrate(), Some(1_000_000.0));
        assert_eq!(measure.readable_bitrate(), "1.00 Mbps");
    }

    #[test]
    fn test_huge_byte_counts_saturate() {
        let measure = ThroughputMeasure::with_clock(4, 4000, ManualClock::new(0)).unwrap();

        measure.count_bytes(i64::MAX / 8);
        measure.count_bytes(1);
        assert_eq!(measure.current_count(), Some(i64::MAX));
    }

    #[test]
    fn test_no_data_is_not_available() {
        let measure = ThroughputMeasure::with_clock(4, 4000, ManualClock::new(0)).unwrap();
        assert_eq!(measure.bitrate(), None);
        assert_eq!(measure.readable_bitrate(), "N/A");
        assert_eq!(measure.readable_frequency(), "N/A");
    }

    #[test]
    fn test_format_bitrate_units() {
        assert_eq!(format_bitrate(Some(12.0)), "12.00 bps");
        assert_eq!(format_bitrate(Some(123_450.0)), "123.45 kbps");
        assert_eq!(format_bitrate(Some(999_999_999.0)), "1000.00 Mbps");
        assert_eq!(format_bitrate(Some(2_500_000_000.0)), "2.50 Gbps");
    }
}
