//! Rolling download-throughput estimate.
//!
//! Byte counts are recorded as they arrive. The estimate is the highest
//! average rate seen over any smoothing window inside the last minute, which
//! tolerates the bursty arrival pattern of segment downloads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Width of the window each rate sample is averaged over.
pub const SMOOTH_INTERVAL: Duration = Duration::from_secs(15);
/// How long computed rate samples are remembered.
pub const MEASURE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct ByteSample {
    at: Instant,
    bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    bytes_per_sec: f64,
}

/// Smoothed bandwidth estimator in bytes per second.
#[derive(Debug)]
pub struct BandwidthApproximator {
    created_at: Instant,
    byte_samples: VecDeque<ByteSample>,
    bytes_in_window: u64,
    rate_samples: VecDeque<RateSample>,
}

impl BandwidthApproximator {
    /// Creates an empty estimator anchored at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            byte_samples: VecDeque::new(),
            bytes_in_window: 0,
            rate_samples: VecDeque::new(),
        }
    }

    /// Records `bytes` received at `at`.
    ///
    /// Timestamps must be non-decreasing.
    pub fn add_bytes(&mut self, bytes: u64, at: Instant) {
        self.byte_samples.push_back(ByteSample { at, bytes });
        self.bytes_in_window += bytes;

        while let Some(oldest) = self.byte_samples.front() {
            if at.saturating_duration_since(oldest.at) <= SMOOTH_INTERVAL {
                break;
            }
            self.bytes_in_window -= oldest.bytes;
            self.byte_samples.pop_front();
        }

        let interval = SMOOTH_INTERVAL.min(at.saturating_duration_since(self.created_at));
        if interval.is_zero() {
            return;
        }

        self.rate_samples.push_back(RateSample {
            at,
            bytes_per_sec: self.bytes_in_window as f64 / interval.as_secs_f64(),
        });
        self.forget_rates_before(at);
    }

    /// Returns the current estimate, zero when nothing was measured recently.
    pub fn bandwidth(&mut self, at: Instant) -> f64 {
        self.forget_rates_before(at);
        self.rate_samples
            .iter()
            .map(|sample| sample.bytes_per_sec)
            .fold(0.0, f64::max)
    }

    fn forget_rates_before(&mut self, at: Instant) {
        while let Some(oldest) = self.rate_samples.front() {
            if at.saturating_duration_since(oldest.at) <= MEASURE_INTERVAL {
                break;
            }
            self.rate_samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_estimator_reports_zero() {
        let start = Instant::now();
        let mut approximator = BandwidthApproximator::new(start);
        assert_eq!(approximator.bandwidth(start + Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn test_rate_uses_elapsed_time_before_window_fills() {
        let start = Instant::now();
        let mut approximator = BandwidthApproximator::new(start);

        approximator.add_bytes(10_000, start + Duration::from_secs(2));

        let estimate = approximator.bandwidth(start + Duration::from_secs(2));
        assert!((estimate - 5_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_samples_outside_smoothing_window_are_dropped() {
        let start = Instant::now();
        let mut approximator = BandwidthApproximator::new(start);

        approximator.add_bytes(150_000, start + Duration::from_secs(15));
        approximator.add_bytes(15_000, start + Duration::from_secs(40));

        // Peak stays the best 15 s average inside the last minute
        let peak = approximator.bandwidth(start + Duration::from_secs(40));
        assert!((peak - 10_000.0).abs() < 1e-6);

        // Once the peak ages out only the later sample remains
        let later = approximator.bandwidth(start + Duration::from_secs(80));
        assert!((later - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_estimate_expires_after_measure_interval() {
        let start = Instant::now();
        let mut approximator = BandwidthApproximator::new(start);

        approximator.add_bytes(1_000, start + Duration::from_secs(1));

        assert!(approximator.bandwidth(start + Duration::from_secs(30)) > 0.0);
        assert_eq!(approximator.bandwidth(start + Duration::from_secs(62)), 0.0);
    }
}
