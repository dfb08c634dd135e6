//! Reduction of a phase's speed history to one number.

use crate::errors::SpeedTestError;
use crate::settings::Settings;
use crate::stats::top_fraction_mean;

/// Averages the fastest fraction of the speed samples and applies the
/// overhead compensation.
///
/// Short dips from packet loss or competing traffic are common; sustained
/// peak throughput is the representative signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedAggregator {
    pub top_fraction: f64,
    pub overhead_factor: f64,
}

impl SpeedAggregator {
    pub fn new(top_fraction: f64, overhead_factor: f64) -> Self {
        Self { top_fraction, overhead_factor }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.top_fraction, settings.overhead_compensation_factor)
    }

    /// Final Mbps for `samples`, which may arrive in any order.
    pub fn reduce(&self, samples: &[f64]) -> Result<f64, SpeedTestError> {
        top_fraction_mean(samples, self.top_fraction)
            .map(|mbps| mbps * self.overhead_factor)
            .ok_or_else(SpeedTestError::insufficient_samples)
    }
}
