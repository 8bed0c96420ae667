//! Rolling IOPS samples and relative standard error
//!
//! The monitor samples the shared atomic ops counter every 100 ms and pushes
//! `delta_ops / delta_seconds` here. The relative standard error over all
//! samples drives the adaptive termination policy; a trailing window
//! supplies the "instantaneous IOPS" shown to progress callbacks.

/// Trailing window length for instantaneous IOPS (10 samples = 1 second at
/// the 100 ms monitor cadence).
const INSTANT_WINDOW: usize = 10;

/// Accumulator for per-tick IOPS samples
#[derive(Debug, Default)]
pub struct RateSampler {
    samples: Vec<f64>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one per-tick IOPS sample
    pub fn push(&mut self, sample: f64) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean over all samples
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Standard error of the mean over all samples (population stddev / sqrt(n))
    pub fn std_err(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>()
            / n as f64;
        variance.sqrt() / (n as f64).sqrt()
    }

    /// Relative standard error (std_err / mean), 0 when the mean is not positive
    pub fn relative_error(&self) -> f64 {
        let mean = self.mean();
        if mean > 0.0 {
            self.std_err() / mean
        } else {
            0.0
        }
    }

    /// Mean of the trailing window, for progress display
    ///
    /// Falls back to the overall mean until a full window has accumulated.
    pub fn instantaneous(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        if n < INSTANT_WINDOW {
            return self.mean();
        }
        self.samples[n - INSTANT_WINDOW..].iter().sum::<f64>() / INSTANT_WINDOW as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let s = RateSampler::new();
        assert_eq!(s.mean(), 0.0);
        assert_eq!(s.std_err(), 0.0);
        assert_eq!(s.relative_error(), 0.0);
        assert_eq!(s.instantaneous(), 0.0);
    }

    #[test]
    fn test_constant_samples_have_zero_error() {
        let mut s = RateSampler::new();
        for _ in 0..20 {
            s.push(1000.0);
        }
        assert_eq!(s.mean(), 1000.0);
        assert_eq!(s.std_err(), 0.0);
        assert_eq!(s.relative_error(), 0.0);
    }

    #[test]
    fn test_mean_and_std_err() {
        let mut s = RateSampler::new();
        s.push(90.0);
        s.push(110.0);
        assert!((s.mean() - 100.0).abs() < 1e-9);
        // population stddev = 10, n = 2 -> std_err = 10 / sqrt(2)
        assert!((s.std_err() - 10.0 / 2f64.sqrt()).abs() < 1e-9);
        assert!((s.relative_error() - 0.0707).abs() < 0.001);
    }

    #[test]
    fn test_instantaneous_uses_trailing_window() {
        let mut s = RateSampler::new();
        // 20 slow samples followed by 10 fast ones
        for _ in 0..20 {
            s.push(100.0);
        }
        for _ in 0..10 {
            s.push(2000.0);
        }
        assert_eq!(s.instantaneous(), 2000.0);
        assert!(s.mean() < 1000.0);
    }

    #[test]
    fn test_instantaneous_partial_window_falls_back_to_mean() {
        let mut s = RateSampler::new();
        s.push(100.0);
        s.push(300.0);
        assert_eq!(s.instantaneous(), 200.0);
    }
}
