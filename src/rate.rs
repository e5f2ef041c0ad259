//! Sliding-window bitrate meter
//!
//! Tracks bytes sent over a bounded window of millisecond-stamped samples
//! and reports an averaged rate. One meter lives on every rate-limited file
//! handle; a process-wide one feeds the send-pressure governor.

use std::collections::VecDeque;

/// Default sampling window for per-handle meters, in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 10_000;

/// Window a meter is trimmed to when sampling is reduced, so freshly
/// started sessions do not distort the average.
pub const REDUCED_WINDOW_MS: u64 = 2_000;

/// Sliding-window byte counter with averaged rate.
#[derive(Debug)]
pub struct RateCalc {
    window_ms: u64,
    samples: VecDeque<(u64, u64)>,
    total: u64,
}

impl RateCalc {
    /// Create a meter averaging over `window_ms` milliseconds.
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record `bytes` sent at `now_ms`. Zero-byte samples are valid and keep
    /// the window advancing while a sender is being throttled.
    pub fn add(&mut self, bytes: u64, now_ms: u64) {
        self.samples.push_back((now_ms, bytes));
        self.total += bytes;
        self.evict(now_ms.saturating_sub(self.window_ms));
    }

    fn evict(&mut self, cutoff_ms: u64) {
        while let Some(&(stamp, bytes)) = self.samples.front() {
            if stamp >= cutoff_ms {
                break;
            }
            self.total -= bytes;
            self.samples.pop_front();
        }
    }

    /// Average rate in bytes per second over the sampled span.
    pub fn avg(&self) -> u64 {
        let (Some(&(oldest, _)), Some(&(newest, _))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let span_ms = newest.saturating_sub(oldest);
        if span_ms == 0 {
            return 0;
        }
        self.total * 1000 / span_ms
    }

    /// Shrink the sampled span to [`REDUCED_WINDOW_MS`], discarding older
    /// samples. Called when sessions start or leave so the average reflects
    /// the current listener population quickly.
    pub fn reduce(&mut self) {
        if let Some(&(newest, _)) = self.samples.back() {
            self.evict(newest.saturating_sub(REDUCED_WINDOW_MS));
        }
    }

    /// Drop all samples, re-arming a zeroed window.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.total = 0;
    }
}

impl Default for RateCalc {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_over_span() {
        let mut rate = RateCalc::new(10_000);
        rate.add(1000, 0);
        rate.add(1000, 500);
        rate.add(1000, 1000);

        // 3000 bytes over one second
        assert_eq!(rate.avg(), 3000);
    }

    #[test]
    fn test_empty_and_single_sample() {
        let mut rate = RateCalc::new(10_000);
        assert_eq!(rate.avg(), 0);
        rate.add(500, 100);
        assert_eq!(rate.avg(), 0);
    }

    #[test]
    fn test_window_eviction() {
        let mut rate = RateCalc::new(1_000);
        rate.add(10_000, 0);
        rate.add(100, 5_000);
        rate.add(100, 5_500);

        // the 10k sample at t=0 fell out of the 1s window
        assert_eq!(rate.avg(), 200 * 1000 / 500);
    }

    #[test]
    fn test_reduce_trims_old_samples() {
        let mut rate = RateCalc::new(10_000);
        rate.add(100_000, 0);
        rate.add(100, 8_000);
        rate.add(100, 9_000);
        rate.reduce();

        // only the samples within the reduced window remain
        assert_eq!(rate.avg(), 200 * 1000 / 1000);
    }

    #[test]
    fn test_reset() {
        let mut rate = RateCalc::new(10_000);
        rate.add(100, 0);
        rate.reset();
        assert_eq!(rate.avg(), 0);
    }
}
