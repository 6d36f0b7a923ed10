#[cfg(any(test, feature = "test-mocks"))]
use mockall::automock;

use crate::ThroughputSample;

/// Throughput estimation seam, mockable so [`crate::AbrManager`] can be
/// tested with scripted estimates.
#[cfg_attr(any(test, feature = "test-mocks"), automock)]
pub trait Estimator: Send {
    /// Estimated throughput in bits per second, `None` until enough data
    /// has been observed.
    fn estimate_bps(&self) -> Option<u64>;

    /// Feed one observed fetch.
    fn push_sample(&mut self, sample: ThroughputSample);
}

/// Dual-EWMA bandwidth estimator.
///
/// Tracks a fast and a slow exponentially-weighted moving average and
/// reports the minimum of the two, so a sudden throughput drop is reflected
/// quickly while a single fast fetch does not inflate the estimate.
#[derive(Clone, Debug)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    initial_bps: f64,
}

impl BandwidthEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 2.0;
    const SLOW_HALF_LIFE_SECS: f64 = 10.0;
    /// Samples smaller than this carry too much per-request overhead to be
    /// representative.
    const MIN_SAMPLE_BYTES: u64 = 16_000;
    const MIN_DURATION_MS: f64 = 0.5;

    #[must_use]
    pub fn new() -> Self {
        Self {
            fast: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
            initial_bps: 0.0,
        }
    }

    /// Seed the estimate used before any sample arrives.
    #[must_use]
    pub fn with_initial_estimate(mut self, bps: u64) -> Self {
        self.initial_bps = bps as f64;
        self
    }

    pub fn estimate_bps(&self) -> Option<u64> {
        let est = self.fast.estimate().min(self.slow.estimate());
        if est > 0.0 {
            Some(est.round() as u64)
        } else if self.initial_bps > 0.0 {
            Some(self.initial_bps.round() as u64)
        } else {
            None
        }
    }

    pub fn push_sample(&mut self, sample: ThroughputSample) {
        if sample.bytes < Self::MIN_SAMPLE_BYTES {
            return;
        }

        let dur_ms = (sample.duration.as_secs_f64() * 1000.0).max(Self::MIN_DURATION_MS);
        let bps = (sample.bytes as f64) * 8000.0 / dur_ms;
        let weight_secs = dur_ms / 1000.0;

        self.fast.add_sample(weight_secs, bps);
        self.slow.add_sample(weight_secs, bps);

        tracing::trace!(
            bytes = sample.bytes,
            dur_ms,
            bps = bps.round(),
            "throughput sample"
        );
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl Estimator for BandwidthEstimator {
    fn estimate_bps(&self) -> Option<u64> {
        self.estimate_bps()
    }

    fn push_sample(&mut self, sample: ThroughputSample) {
        self.push_sample(sample);
    }
}

#[derive(Clone, Debug)]
struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn add_sample(&mut self, weight: f64, val: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.last_estimate = val * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight.max(0.0);
    }

    fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            0.0
        } else {
            // Correct for the startup bias toward zero.
            let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
            self.last_estimate / zero_factor.max(1e-6)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    fn sample(bytes: u64, millis: u64) -> ThroughputSample {
        ThroughputSample {
            bytes,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn no_estimate_without_samples() {
        let est = BandwidthEstimator::new();
        assert_eq!(est.estimate_bps(), None);
    }

    #[test]
    fn initial_estimate_used_until_first_sample() {
        let mut est = BandwidthEstimator::new().with_initial_estimate(5_000_000);
        assert_eq!(est.estimate_bps(), Some(5_000_000));

        est.push_sample(sample(125_000, 1000)); // 1 Mbps
        let measured = est.estimate_bps().unwrap();
        assert!(measured < 5_000_000, "measured {measured} should override seed");
    }

    #[rstest]
    #[case::single(vec![(500_000, 1000)], 3_500_000)]
    #[case::stable(vec![(500_000, 1000), (500_000, 1000)], 3_800_000)]
    #[case::sustained(vec![(1_000_000, 1000); 3], 7_500_000)]
    fn converges_toward_observed_rate(#[case] samples: Vec<(u64, u64)>, #[case] min_bps: u64) {
        let mut est = BandwidthEstimator::new();
        for (bytes, millis) in samples {
            est.push_sample(sample(bytes, millis));
        }
        let got = est.estimate_bps().expect("estimate after samples");
        assert!(got >= min_bps, "estimate {got} below {min_bps}");
    }

    #[test]
    fn small_samples_are_ignored() {
        let mut est = BandwidthEstimator::new();
        est.push_sample(sample(10_000, 100));
        assert_eq!(est.estimate_bps(), None);

        est.push_sample(sample(100_000, 1000));
        assert!(est.estimate_bps().is_some());
    }

    #[test]
    fn drop_reflected_quickly() {
        let mut est = BandwidthEstimator::new();
        for _ in 0..5 {
            est.push_sample(sample(1_250_000, 1000)); // 10 Mbps
        }
        let before = est.estimate_bps().unwrap();

        for _ in 0..3 {
            est.push_sample(sample(125_000, 1000)); // 1 Mbps
        }
        let after = est.estimate_bps().unwrap();
        assert!(after < before / 2, "estimate should track the drop: {before} -> {after}");
    }

    #[test]
    fn zero_duration_is_clamped() {
        let mut est = BandwidthEstimator::new();
        est.push_sample(ThroughputSample {
            bytes: 100_000,
            duration: Duration::ZERO,
        });
        assert!(est.estimate_bps().unwrap() > 1_000_000);
    }
}
