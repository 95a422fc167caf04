use crate::chunker::ChunkConfig;
use crate::errors::{EstimateError, Result};
use crate::matrix::{BinStatistic, MatrixConfig};
use crate::store::RetryPolicy;
use pmkrig_gp::{DEFAULT_JITTER, DEFAULT_NOISE_VARIANCE, DEFAULT_SIGNAL_VARIANCE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bounding box radius of fetched readings, in spatial length scales
pub const SPACE_PADDING_FACTOR: f64 = 2.;
/// Predictions below this value before clipping denote numerical trouble
pub const SANITY_FLOOR: f64 = -5.;
/// Variances below `-VARIANCE_TOLERANCE` are reported as negative
pub const VARIANCE_TOLERANCE: f64 = 1e-6;

/// Estimation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub(crate) matrix: MatrixConfig,
    pub(crate) chunks: ChunkConfig,
    pub(crate) space_padding_factor: f64,
    pub(crate) noise_variance: f64,
    pub(crate) signal_variance: f64,
    pub(crate) jitter: f64,
    pub(crate) sanity_floor: f64,
    pub(crate) apply_corrections: bool,
    pub(crate) aggregation_hours: Option<f64>,
    pub(crate) full_covariance: bool,
    pub(crate) parallel: bool,
    pub(crate) retry: RetryPolicy,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            matrix: MatrixConfig::default(),
            chunks: ChunkConfig::default(),
            space_padding_factor: SPACE_PADDING_FACTOR,
            noise_variance: DEFAULT_NOISE_VARIANCE,
            signal_variance: DEFAULT_SIGNAL_VARIANCE,
            jitter: DEFAULT_JITTER,
            sanity_floor: SANITY_FLOOR,
            apply_corrections: true,
            aggregation_hours: None,
            full_covariance: false,
            parallel: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl EstimatorConfig {
    /// Load settings from a JSON file, missing fields take their default value
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EstimatorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets matrix building thresholds
    pub fn matrix(mut self, matrix: MatrixConfig) -> Self {
        self.matrix = matrix;
        self
    }

    /// Sets chunking factors
    pub fn chunks(mut self, chunks: ChunkConfig) -> Self {
        self.chunks = chunks;
        self
    }

    /// Sets the readings fetch radius in spatial length scales
    pub fn space_padding_factor(mut self, factor: f64) -> Self {
        self.space_padding_factor = factor;
        self
    }

    /// Sets the observation noise variance
    pub fn noise_variance(mut self, noise_variance: f64) -> Self {
        self.noise_variance = noise_variance;
        self
    }

    /// Sets the prior signal variance
    pub fn signal_variance(mut self, signal_variance: f64) -> Self {
        self.signal_variance = signal_variance;
        self
    }

    /// Sets the kernel jitter
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the prediction sanity floor
    pub fn sanity_floor(mut self, floor: f64) -> Self {
        self.sanity_floor = floor;
        self
    }

    /// Whether area correction factors are applied to readings
    pub fn apply_corrections(mut self, apply: bool) -> Self {
        self.apply_corrections = apply;
        self
    }

    /// Estimate time aggregates: readings are averaged over bins of `hours` and taken as
    /// noise free
    pub fn aggregation_hours(mut self, hours: Option<f64>) -> Self {
        self.aggregation_hours = hours;
        self
    }

    /// Whether the posterior covariance between query locations is computed at each time
    pub fn full_covariance(mut self, full: bool) -> Self {
        self.full_covariance = full;
        self
    }

    /// Whether chunks are computed in parallel
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the sensor store retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Matrix building thresholds
    pub fn matrix_config(&self) -> &MatrixConfig {
        &self.matrix
    }

    /// Chunking factors
    pub fn chunk_config(&self) -> &ChunkConfig {
        &self.chunks
    }

    /// Sensor store retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Matrix thresholds and observation noise actually used, aggregates being averaged
    /// over their interval without noise
    pub(crate) fn binning(&self) -> (MatrixConfig, f64) {
        match self.aggregation_hours {
            Some(hours) => (
                MatrixConfig {
                    bin_minutes: 60. * hours,
                    statistic: BinStatistic::Mean,
                    ..self.matrix
                },
                0.,
            ),
            None => (self.matrix, self.noise_variance),
        }
    }

    /// Check settings consistency
    pub fn validate(&self) -> Result<()> {
        self.matrix.validate()?;
        self.chunks.validate()?;
        if !(self.space_padding_factor.is_finite() && self.space_padding_factor > 0.) {
            return Err(EstimateError::InvalidConfig(format!(
                "space padding factor should be positive, got {}",
                self.space_padding_factor
            )));
        }
        for (name, v) in [
            ("noise variance", self.noise_variance),
            ("signal variance", self.signal_variance),
        ] {
            if !(v.is_finite() && v > 0.) {
                return Err(EstimateError::InvalidConfig(format!(
                    "{name} should be positive, got {v}"
                )));
            }
        }
        if let Some(hours) = self.aggregation_hours {
            if !(hours.is_finite() && hours > 0.) {
                return Err(EstimateError::InvalidConfig(format!(
                    "aggregation interval should be positive, got {hours} h"
                )));
            }
        }
        if !(self.jitter.is_finite() && self.jitter >= 0.) {
            return Err(EstimateError::InvalidConfig(format!(
                "jitter should be non negative, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json() {
        let config: EstimatorConfig =
            serde_json::from_str(r#"{"jitter": 0.01, "matrix": {"bin_minutes": 10}}"#).unwrap();
        assert_eq!(config.jitter, 0.01);
        assert_eq!(config.matrix.bin_minutes, 10.);
        assert_eq!(config.matrix.max_gap_bins, 6);
        assert_eq!(config.chunks, ChunkConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_aggregation_binning() {
        let config = EstimatorConfig::default();
        assert_eq!(config.binning(), (MatrixConfig::default(), DEFAULT_NOISE_VARIANCE));

        let config: EstimatorConfig =
            serde_json::from_str(r#"{"aggregation_hours": 2, "full_covariance": true}"#).unwrap();
        assert!(config.full_covariance);
        let (matrix, noise) = config.binning();
        assert_eq!(matrix.bin_minutes, 120.);
        assert_eq!(matrix.statistic, BinStatistic::Mean);
        assert_eq!(matrix.max_gap_bins, 6);
        assert_eq!(noise, 0.);
        assert!(config.aggregation_hours(Some(0.)).validate().is_err());
    }

    #[test]
    fn test_invalid_config() {
        assert!(EstimatorConfig::default().noise_variance(0.).validate().is_err());
        assert!(EstimatorConfig::default().jitter(-1.).validate().is_err());
        assert!(EstimatorConfig::default()
            .chunks(ChunkConfig {
                chunk_factor: 0.,
                padding_factor: 3.
            })
            .validate()
            .is_err());
    }
}
