use std::time::Duration;

use crate::quality::QualityTier;

/// Bandwidth estimate from fragment downloads: the lower of a fast and a slow
/// exponentially weighted average, seeded with a default until measured.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    fast: Ewma,
    slow: Ewma,
    default_bps: u64,
}

impl ThroughputEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 3.0;
    const SLOW_HALF_LIFE_SECS: f64 = 9.0;
    const MIN_SAMPLE_BYTES: usize = 1_000;

    pub fn new(default_bps: u64) -> Self {
        Self {
            fast: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
            default_bps,
        }
    }

    pub fn push_sample(&mut self, bytes: usize, elapsed: Duration) {
        if bytes < Self::MIN_SAMPLE_BYTES {
            return;
        }
        let secs = elapsed.as_secs_f64().max(0.001);
        let bps = bytes as f64 * 8.0 / secs;
        self.fast.add_sample(secs, bps);
        self.slow.add_sample(secs, bps);
    }

    pub fn estimate_bps(&self) -> u64 {
        let est = self.fast.estimate().min(self.slow.estimate());
        if est > 0.0 {
            est.round() as u64
        } else {
            self.default_bps
        }
    }

    /// Highest-bitrate tier the estimate can sustain, else the cheapest one.
    pub fn pick(&self, tiers: &[QualityTier]) -> Option<usize> {
        let budget = self.estimate_bps();
        tiers
            .iter()
            .filter(|t| t.bitrate_bps <= budget)
            .max_by_key(|t| t.bitrate_bps)
            .or_else(|| tiers.iter().min_by_key(|t| t.bitrate_bps))
            .map(|t| t.index)
    }
}

#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn add_sample(&mut self, weight: f64, value: f64) {
        let adj_alpha = self.alpha.powf(weight);
        self.last_estimate = value * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight;
    }

    fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        self.last_estimate / (1.0 - self.alpha.powf(self.total_weight))
    }
}
