//! Windowed counter implementation.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::{RatewatchError, Result};

/// Counts units over a trailing time window.
///
/// The window is split into `buffer_size` slots arranged as a ring. Each
/// slot covers one probe duration (`window_length / buffer_size`). Slots are
/// invalidated lazily: nothing runs in the background, every call to
/// [`count`](Self::count) or [`current_count`](Self::current_count) first
/// skips the ring forward over the time elapsed since the last probe and
/// empties the slots it passes.
///
/// The counter is thread-safe; all operations take `&self`.
pub struct WindowedCounter<C: Clock = SystemClock> {
    /// Total tracked duration in milliseconds
    window_ms: i64,
    /// Time span covered by one slot, in milliseconds
    probe_duration_ms: f64,
    /// Ring buffer and probe bookkeeping
    state: Mutex<ProbeRing>,
    /// Time source
    clock: C,
}

/// The mutable part of a [`WindowedCounter`].
struct ProbeRing {
    /// `None` marks an empty slot
    slots: Vec<Option<i64>>,
    /// Timestamp of the last write, `None` before the first one
    last_probe_ms: Option<i64>,
    /// Index of the most recently written slot
    current: usize,
}

impl ProbeRing {
    fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            last_probe_ms: None,
            current: 0,
        }
    }

    fn record(&mut self, now_ms: i64, units: i64, probe_duration_ms: f64) {
        let Some(last_probe_ms) = self.last_probe_ms else {
            // A zero probe on an unused ring records nothing.
            if units != 0 {
                self.slots[0] = Some(units);
                self.last_probe_ms = Some(now_ms);
                self.current = 0;
            }
            return;
        };

        let elapsed = now_ms.saturating_sub(last_probe_ms) as f64;
        if elapsed < probe_duration_ms {
            if units != 0 {
                let slot = &mut self.slots[self.current];
                *slot = Some(slot.unwrap_or(0).saturating_add(units));
            }
            return;
        }

        let len = self.slots.len();
        let advance = (elapsed / probe_duration_ms).floor() as u64;
        let passed = (advance - 1).min(len as u64) as usize;
        for step in 1..=passed {
            self.slots[(self.current + step) % len] = None;
        }
        self.current = (self.current + (advance % len as u64) as usize) % len;
        self.slots[self.current] = (units != 0).then_some(units);
        self.last_probe_ms = Some(now_ms);

        trace!(
            advance = advance,
            slot = self.current,
            units = units,
            "Advanced probe ring"
        );
    }

    fn sum(&self) -> Option<i64> {
        self.slots
            .iter()
            .flatten()
            .fold(None, |acc, &units| Some(acc.unwrap_or(0i64).saturating_add(units)))
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.last_probe_ms = None;
        self.current = 0;
    }
}

impl WindowedCounter {
    /// Create a counter with `buffer_size` slots over `window_ms` milliseconds.
    ///
    /// Fails with [`RatewatchError::InvalidArgument`] if either is not positive.
    pub fn new(buffer_size: u32, window_ms: i64) -> Result<Self> {
        Self::with_clock(buffer_size, window_ms, SystemClock::new())
    }
}

impl<C: Clock> WindowedCounter<C> {
    /// Create a counter that reads time from `clock`.
    pub fn with_clock(buffer_size: u32, window_ms: i64, clock: C) -> Result<Self> {
        if buffer_size == 0 {
            return Err(RatewatchError::InvalidArgument(
                "buffer size must be positive".to_string(),
            ));
        }
        if window_ms <= 0 {
            return Err(RatewatchError::InvalidArgument(format!(
                "window length must be positive, got {} ms",
                window_ms
            )));
        }

        Ok(Self {
            window_ms,
            probe_duration_ms: window_ms as f64 / buffer_size as f64,
            state: Mutex::new(ProbeRing::new(buffer_size as usize)),
            clock,
        })
    }

    /// Record `units` at the current time.
    pub fn count(&self, units: i64) {
        let now_ms = self.clock.now_ms();
        self.state.lock().record(now_ms, units, self.probe_duration_ms);
    }

    /// Zero-unit probe: expire stale slots without recording activity.
    pub fn probe(&self) {
        self.count(0);
    }

    /// Total units recorded over the trailing window.
    ///
    /// Returns `None` when no slot holds data, either because nothing was
    /// ever counted or because everything counted has aged out.
    pub fn current_count(&self) -> Option<i64> {
        let now_ms = self.clock.now_ms();
        let mut ring = self.state.lock();
        ring.record(now_ms, 0, self.probe_duration_ms);
        ring.sum()
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        self.state.lock().clear();
    }

    /// Number of slots in the ring.
    pub fn buffer_size(&self) -> u32 {
        self.state.lock().slots.len() as u32
    }

    /// Window length in milliseconds.
    pub fn window_length(&self) -> i64 {
        self.window_ms
    }

    /// Time covered by one slot, in milliseconds.
    pub fn probe_duration_ms(&self) -> f64 {
        self.probe_duration_ms
    }

    /// The clock this counter reads.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> fmt::Debug for WindowedCounter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.state.lock();
        f.debug_struct("WindowedCounter")
            .field("window_ms", &self.window_ms)
            .field("probe_duration_ms", &self.probe_duration_ms)
            .field("slots", &ring.slots)
            .field("last_probe_ms", &ring.last_probe_ms)
            .field("current", &ring.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn manual_counter(buffer_size: u32, window_ms: i64) -> (WindowedCounter<ManualClock>, ManualClock) {
        let clock = ManualClock::new(0);
        let counter = WindowedCounter::with_clock(buffer_size, window_ms, clock.clone()).unwrap();
        (counter, clock)
    }

    #[test]
    fn test_rejects_invalid_arguments() {
        assert!(matches!(
            WindowedCounter::new(0, 1000),
            Err(RatewatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            WindowedCounter::new(4, 0),
            Err(RatewatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            WindowedCounter::new(4, -10),
            Err(RatewatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_accessors() {
        let (counter, _clock) = manual_counter(8, 2000);
        assert_eq!(counter.buffer_size(), 8);
        assert_eq!(counter.window_length(), 2000);
        assert_eq!(counter.probe_duration_ms(), 250.0);
    }

    #[test]
    fn test_fresh_counter_has_no_data() {
        let (counter, _clock) = manual_counter(4, 4000);
        assert_eq!(counter.current_count(), None);
        // Querying twice must not fabricate a zero sample.
        assert_eq!(counter.current_count(), None);
    }

    #[test]
    fn test_counts_within_one_probe_accumulate() {
        let (counter, clock) = manual_counter(4, 4000);

        counter.count(3);
        clock.advance(200);
        counter.count(5);
        clock.advance(700);
        counter.count(2);

        assert_eq!(counter.current_count(), Some(10));
    }

    #[test]
    fn test_accumulation_saturates_at_max() {
        let (counter, clock) = manual_counter(4, 4000);

        counter.count(i64::MAX);
        clock.advance(100);
        counter.count(1);
        assert_eq!(counter.current_count(), Some(i64::MAX));

        counter.count(-1);
        assert_eq!(counter.current_count(), Some(i64::MAX - 1));
    }

    #[test]
    fn test_huge_gap_with_tiny_slots() {
        // 1000 slots over 1 ms: each slot covers a microsecond.
        let (counter, clock) = manual_counter(1000, 1);

        counter.count(5);
        clock.set(i64::MAX);
        counter.count(2);
        assert_eq!(counter.current_count(), Some(2));
    }

    #[test]
    fn test_counts_one_second_apart_then_window_expires() {
        let (counter, clock) = manual_counter(4, 4000);

        for i in 0..4 {
            if i > 0 {
                clock.advance(1000);
            }
            counter.count(1);
        }
        assert_eq!(counter.current_count(), Some(4));

        clock.advance(4000);
        assert_eq!(counter.current_count(), None);
    }

    #[test]
    fn test_old_slots_age_out_one_by_one() {
        let (counter, clock) = manual_counter(4, 4000);

        counter.count(10);
        clock.advance(1000);
        counter.count(20);
        assert_eq!(counter.current_count(), Some(30));

        // Three more probe durations: the slot holding 10 is lapped.
        clock.advance(3000);
        assert_eq!(counter.current_count(), Some(20));

        clock.advance(1000);
        assert_eq!(counter.current_count(), None);
    }

    #[test]
    fn test_long_idle_gap_keeps_only_new_value() {
        let (counter, clock) = manual_counter(4, 4000);

        counter.count(7);
        clock.advance(1000);
        counter.count(7);

        clock.advance(60_000);
        counter.count(2);
        assert_eq!(counter.current_count(), Some(2));
    }

    #[test]
    fn test_zero_probe_does_not_record_activity() {
        let (counter, clock) = manual_counter(4, 4000);

        counter.probe();
        assert_eq!(counter.current_count(), None);

        counter.count(1);
        clock.advance(1500);
        counter.probe();
        assert_eq!(counter.current_count(), Some(1));
    }

    #[test]
    fn test_reset_clears_everything() {
        let (counter, clock) = manual_counter(4, 4000);

        counter.count(5);
        clock.advance(1000);
        counter.count(5);
        counter.reset();
        assert_eq!(counter.current_count(), None);

        counter.count(3);
        assert_eq!(counter.current_count(), Some(3));
    }

    #[test]
    fn test_concurrent_counts_are_not_lost() {
        use std::sync::Arc;
        use std::thread;

        let (counter, _clock) = manual_counter(10, 1000);
        let counter = Arc::new(counter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.count(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.current_count(), Some(8000));
    }

    proptest! {
        #[test]
        fn prop_counts_within_one_probe_sum_up(
            samples in prop::collection::vec((-1000i64..1000, 0i64..100), 1..50)
        ) {
            // 10 slots over 1000 ms: every offset below 100 ms stays in slot 0.
            let (counter, clock) = manual_counter(10, 1000);
            let mut samples = samples;
            samples.sort_by_key(|&(_, offset)| offset);

            for &(units, offset) in &samples {
                clock.set(offset);
                counter.count(units);
            }

            let expected = if samples.iter().any(|&(units, _)| units != 0) {
                Some(samples.iter().map(|&(units, _)| units).sum::<i64>())
            } else {
                None
            };
            prop_assert_eq!(counter.current_count(), expected);
        }
    }
}
