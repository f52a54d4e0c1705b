//! Per-stage execution statistics.
//!
//! [`PerformanceData`] keeps O(1) running statistics of a stage's per-block
//! calls. The chain resets it at Allocate and updates it after every timed
//! call while profiling is enabled.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Call statistics for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceData {
    /// Number of recorded calls
    pub count: u64,
    /// Cumulative duration of all recorded calls
    pub total: Duration,
    /// Shortest call; `Duration::MAX` until the first call is recorded
    pub min: Duration,
    /// Longest call
    pub max: Duration,
    /// Nominal duration of one sample block
    pub block_duration: Duration,
}

impl Default for PerformanceData {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl PerformanceData {
    pub fn new(block_duration: Duration) -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            block_duration,
        }
    }

    /// Clear all counters and record a new block duration.
    pub fn reset(&mut self, block_duration: Duration) {
        *self = Self::new(block_duration);
    }

    /// Add one call of duration `elapsed`.
    #[inline]
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(elapsed);
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    /// Mean call duration, zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    /// Mean call duration as a fraction of the block duration.
    pub fn load(&self) -> f64 {
        if self.block_duration.is_zero() {
            0.0
        } else {
            self.mean().as_secs_f64() / self.block_duration.as_secs_f64()
        }
    }

    /// Shortest call, or zero when nothing was recorded.
    pub fn min_or_zero(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.min
        }
    }
}

/// Wall-clock stopwatch around a single stage call.
#[derive(Debug, Clone, Copy)]
pub struct StopWatch {
    started: Instant,
}

impl StopWatch {
    #[inline]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reset_state() {
        let data = PerformanceData::new(Duration::from_millis(50));
        assert_eq!(data.count, 0);
        assert_eq!(data.min, Duration::MAX);
        assert_eq!(data.max, Duration::ZERO);
        assert_eq!(data.mean(), Duration::ZERO);
        assert_eq!(data.min_or_zero(), Duration::ZERO);
    }

    #[test]
    fn test_record_and_load() {
        let mut data = PerformanceData::new(Duration::from_millis(100));
        data.record(Duration::from_millis(10));
        data.record(Duration::from_millis(30));
        assert_eq!(data.count, 2);
        assert_eq!(data.total, Duration::from_millis(40));
        assert_eq!(data.min, Duration::from_millis(10));
        assert_eq!(data.max, Duration::from_millis(30));
        assert_eq!(data.mean(), Duration::from_millis(20));
        assert!((data.load() - 0.2).abs() < 1e-9);

        data.reset(Duration::from_millis(10));
        assert_eq!(data.count, 0);
        assert_eq!(data.block_duration, Duration::from_millis(10));
    }

    #[test]
    fn test_stopwatch_measures() {
        let watch = StopWatch::start();
        std::thread::sleep(Duration::from_millis(2));
        assert!(watch.elapsed() >= Duration::from_millis(2));
    }

    proptest! {
        #[test]
        fn prop_min_le_mean_le_max(samples in prop::collection::vec(0u64..1_000_000, 1..50)) {
            let mut data = PerformanceData::default();
            for s in &samples {
                data.record(Duration::from_nanos(*s));
            }
            prop_assert_eq!(data.count, samples.len() as u64);
            prop_assert!(data.min <= data.mean());
            prop_assert!(data.mean() <= data.max);
        }
    }
}
