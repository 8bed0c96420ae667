//! Latency histogram
//!
//! Wraps HdrHistogram for recording per-operation latencies in integer
//! microseconds. The histogram tracks 1 microsecond to 1 hour at 3
//! significant figures (better than 1% quantile error over the whole range)
//! in constant memory, and merges are exact bucketed unions, so per-worker
//! histograms can be combined after join without losing precision.

use crate::Result;
use hdrhistogram::Histogram;
use std::time::Duration;

/// Highest trackable latency: one hour, in microseconds.
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Mergeable microsecond-resolution latency histogram
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    hist: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let hist = Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)
            .expect("histogram bounds are static and valid");
        Self { hist }
    }

    /// Record a latency in microseconds
    ///
    /// Values below 1 (sub-microsecond completions) are clamped to 1.
    /// Values above the trackable maximum are dropped; anything past an hour
    /// is a hung system, not a latency sample.
    #[inline]
    pub fn record(&mut self, val_us: u64) {
        let val = val_us.max(1);
        if val > MAX_LATENCY_US {
            return;
        }
        let _ = self.hist.record(val);
    }

    /// Record a latency expressed as a `Duration`
    #[inline]
    pub fn record_duration(&mut self, latency: Duration) {
        self.record(latency.as_micros() as u64);
    }

    /// Merge another histogram into this one
    ///
    /// Merging is additive in bucket counts: associative, commutative, and
    /// preserving of min/max/sum/count.
    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.hist
            .add(&other.hist)
            .map_err(|e| anyhow::anyhow!("failed to merge histograms: {}", e))?;
        Ok(())
    }

    /// Value in microseconds at quantile `q` in [0.0, 1.0]
    pub fn value_at_quantile(&self, q: f64) -> u64 {
        self.hist.value_at_percentile(q * 100.0)
    }

    /// Latency as a `Duration` at quantile `q` in [0.0, 1.0]
    pub fn duration_at_quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.value_at_quantile(q))
    }

    /// Mean recorded latency in microseconds
    pub fn mean(&self) -> f64 {
        self.hist.mean()
    }

    /// Minimum recorded value in microseconds (0 when empty)
    pub fn min(&self) -> u64 {
        self.hist.min()
    }

    /// Maximum recorded value in microseconds (0 when empty)
    pub fn max(&self) -> u64 {
        self.hist.max()
    }

    /// Total number of recorded values
    pub fn total_count(&self) -> u64 {
        self.hist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }

    /// Clear all recorded samples
    pub fn reset(&mut self) {
        self.hist.reset();
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_values(values: &[u64]) -> LatencyHistogram {
        let mut h = LatencyHistogram::new();
        for &v in values {
            h.record(v);
        }
        h
    }

    #[test]
    fn test_record_and_count() {
        let h = from_values(&[100, 200, 300]);
        assert_eq!(h.total_count(), 3);
        assert!(!h.is_empty());
    }

    #[test]
    fn test_zero_clamped_to_one() {
        let h = from_values(&[0]);
        assert_eq!(h.total_count(), 1);
        assert_eq!(h.min(), 1);
    }

    #[test]
    fn test_overflow_dropped() {
        let h = from_values(&[MAX_LATENCY_US + 1]);
        assert_eq!(h.total_count(), 0);
    }

    #[test]
    fn test_quantiles() {
        let mut h = LatencyHistogram::new();
        for i in 1..=1000u64 {
            h.record(i);
        }
        let p50 = h.value_at_quantile(0.5);
        let p99 = h.value_at_quantile(0.99);
        assert!((450..=550).contains(&p50), "p50 = {}", p50);
        assert!((940..=1000).contains(&p99), "p99 = {}", p99);
    }

    #[test]
    fn test_quantile_monotonicity() {
        let mut h = LatencyHistogram::new();
        for i in 0..500u64 {
            h.record(i * 17 % 10_000 + 1);
        }
        let quantiles = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 0.999, 1.0];
        for w in quantiles.windows(2) {
            assert!(
                h.value_at_quantile(w[0]) <= h.value_at_quantile(w[1]),
                "quantile {} > quantile {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_merge_counts_and_extrema() {
        let mut a = from_values(&[100, 200]);
        let b = from_values(&[50, 400]);
        a.merge(&b).unwrap();

        assert_eq!(a.total_count(), 4);
        assert_eq!(a.min(), 50);
        assert!(a.max() >= 399 && a.max() <= 401);
    }

    #[test]
    fn test_merge_associative() {
        let xs: Vec<u64> = (1..200).map(|i| i * 3 + 1).collect();
        let ys: Vec<u64> = (1..150).map(|i| i * 7 + 2).collect();
        let zs: Vec<u64> = (1..100).map(|i| i * 11 + 5).collect();

        // (A + B) + C
        let mut left = from_values(&xs);
        left.merge(&from_values(&ys)).unwrap();
        left.merge(&from_values(&zs)).unwrap();

        // A + (B + C)
        let mut bc = from_values(&ys);
        bc.merge(&from_values(&zs)).unwrap();
        let mut right = from_values(&xs);
        right.merge(&bc).unwrap();

        assert_eq!(left.total_count(), (xs.len() + ys.len() + zs.len()) as u64);
        assert_eq!(left.total_count(), right.total_count());
        assert_eq!(left.min(), right.min());
        assert_eq!(left.max(), right.max());
        for q in [0.1, 0.5, 0.9, 0.99, 0.999] {
            assert_eq!(left.value_at_quantile(q), right.value_at_quantile(q));
        }
    }

    #[test]
    fn test_merge_commutative() {
        let mut ab = from_values(&[10, 20, 30]);
        ab.merge(&from_values(&[5, 500])).unwrap();

        let mut ba = from_values(&[5, 500]);
        ba.merge(&from_values(&[10, 20, 30])).unwrap();

        assert_eq!(ab.total_count(), ba.total_count());
        for q in [0.0, 0.5, 1.0] {
            assert_eq!(ab.value_at_quantile(q), ba.value_at_quantile(q));
        }
    }

    #[test]
    fn test_reset() {
        let mut h = from_values(&[100, 200]);
        h.reset();
        assert!(h.is_empty());
        assert_eq!(h.total_count(), 0);
    }
}
