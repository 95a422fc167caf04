use crate::errors::{GpError, Result};
use crate::{
    GpFloat, DEFAULT_JITTER, DEFAULT_NOISE_VARIANCE, DEFAULT_SIGNAL_VARIANCE, GP_COBYLA_MAX_EVAL,
    GP_COBYLA_MIN_EVAL, GP_OPTIM_N_START,
};
use linfa::{Float, ParamGuard};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Hyperparameters of the separable space-time kernel
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Hyperparameters<F: Float> {
    /// Length scale (meters) on planar coordinates
    pub latlon_length_scale: F,
    /// Length scale (meters) on elevation
    pub elevation_length_scale: F,
    /// Length scale (hours) on time
    pub time_length_scale: F,
    /// Observation noise variance added on the diagonal
    pub noise_variance: F,
    /// Prior variance of the latent signal
    pub signal_variance: F,
}

impl<F: Float> Hyperparameters<F> {
    /// Hyperparameters with given length scales and default variances
    pub fn new(latlon_length_scale: F, elevation_length_scale: F, time_length_scale: F) -> Self {
        Hyperparameters {
            latlon_length_scale,
            elevation_length_scale,
            time_length_scale,
            noise_variance: F::cast(DEFAULT_NOISE_VARIANCE),
            signal_variance: F::cast(DEFAULT_SIGNAL_VARIANCE),
        }
    }

    /// Values as an array in a fixed order (latlon, elevation, time, noise, signal)
    pub fn to_array(&self) -> [F; 5] {
        [
            self.latlon_length_scale,
            self.elevation_length_scale,
            self.time_length_scale,
            self.noise_variance,
            self.signal_variance,
        ]
    }

    /// Inverse of [`Hyperparameters::to_array`]
    pub fn from_array(values: [F; 5]) -> Self {
        Hyperparameters {
            latlon_length_scale: values[0],
            elevation_length_scale: values[1],
            time_length_scale: values[2],
            noise_variance: values[3],
            signal_variance: values[4],
        }
    }

    fn check(&self) -> Result<()> {
        let names = [
            "latlon length scale",
            "elevation length scale",
            "time length scale",
            "noise variance",
            "signal variance",
        ];
        for (name, v) in names.iter().zip(self.to_array()) {
            // noise free observations are allowed, e.g. time averaged readings
            let valid = if *name == "noise variance" {
                v >= F::zero()
            } else {
                v > F::zero()
            };
            if !(v.is_finite() && valid) {
                return Err(GpError::InvalidValueError(format!(
                    "{name} should be a finite value {}, got {v}",
                    if *name == "noise variance" { ">= 0" } else { "> 0" }
                )));
            }
        }
        Ok(())
    }
}

/// Hyperparameter tuning strategy
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum HyperTuning<F: Float> {
    /// Hyperparameters are given, not estimated
    #[default]
    Fixed,
    /// Hyperparameters are estimated by likelihood maximization
    /// within `[lower, upper]` starting from the given ones
    Optimized {
        /// Lower bounds
        lower: Hyperparameters<F>,
        /// Upper bounds
        upper: Hyperparameters<F>,
    },
}

/// Decomposition strategy of the space-time kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Decomposition {
    /// Kronecker decomposition when the time axis is regular, dense otherwise
    #[default]
    Auto,
    /// Kronecker product of spatial and circulant temporal eigenbases (regular time axis only)
    Kronecker,
    /// Dense eigendecomposition of the full space-time kernel
    Dense,
}

/// A set of validated spatiotemporal GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct StGpValidParams<F: Float> {
    /// Kernel hyperparameters (initial guess when optimized)
    pub(crate) hyper: Hyperparameters<F>,
    /// Value added to spatial and temporal kernel diagonals
    pub(crate) jitter: F,
    /// Kernel decomposition strategy
    pub(crate) decomposition: Decomposition,
    /// Hyperparameter tuning
    pub(crate) tuning: HyperTuning<F>,
    /// Number of internal likelihood optimization restart
    pub(crate) n_start: usize,
    /// Max number of internal likelihood evaluation during optimization
    pub(crate) max_eval: usize,
}

impl<F: Float> StGpValidParams<F> {
    /// Get kernel hyperparameters
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        &self.hyper
    }

    /// Get jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Get decomposition strategy
    pub fn decomposition(&self) -> Decomposition {
        self.decomposition
    }

    /// Get hyperparameter tuning
    pub fn tuning(&self) -> &HyperTuning<F> {
        &self.tuning
    }

    /// Get the number of internal optimization restart
    pub fn n_start(&self) -> usize {
        self.n_start
    }

    /// Get the max number of internal likelihood evaluations during one optimization
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }

    /// Same parameters with other hyperparameters and fixed tuning
    pub(crate) fn with_hyperparameters(&self, hyper: Hyperparameters<F>) -> Self {
        StGpValidParams {
            hyper,
            tuning: HyperTuning::Fixed,
            ..self.clone()
        }
    }

    /// Same parameters with another jitter
    pub(crate) fn with_jitter(&self, jitter: F) -> Self {
        StGpValidParams {
            jitter,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [spatiotemporal GP algorithm](crate::SpaceTimeGp).
pub struct StGpParams<F: Float>(StGpValidParams<F>);

impl<F: Float> StGpParams<F> {
    /// A constructor given the three kernel length scales, default variances are used
    pub fn new(latlon_length_scale: F, elevation_length_scale: F, time_length_scale: F) -> Self {
        Self(StGpValidParams {
            hyper: Hyperparameters::new(
                latlon_length_scale,
                elevation_length_scale,
                time_length_scale,
            ),
            jitter: F::cast(DEFAULT_JITTER),
            decomposition: Decomposition::default(),
            tuning: HyperTuning::default(),
            n_start: GP_OPTIM_N_START,
            max_eval: GP_COBYLA_MAX_EVAL,
        })
    }

    /// A constructor from validated parameters
    pub fn new_from_valid(params: &StGpValidParams<F>) -> Self {
        Self(params.clone())
    }

    /// Set all kernel hyperparameters
    pub fn hyperparameters(mut self, hyper: Hyperparameters<F>) -> Self {
        self.0.hyper = hyper;
        self
    }

    /// Set noise variance
    pub fn noise_variance(mut self, noise_variance: F) -> Self {
        self.0.hyper.noise_variance = noise_variance;
        self
    }

    /// Set signal variance
    pub fn signal_variance(mut self, signal_variance: F) -> Self {
        self.0.hyper.signal_variance = signal_variance;
        self
    }

    /// Set jitter.
    ///
    /// Jitter is added to the spatial and temporal kernel diagonals before decomposition
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set decomposition strategy
    pub fn decomposition(mut self, decomposition: Decomposition) -> Self {
        self.0.decomposition = decomposition;
        self
    }

    /// Set hyperparameter tuning
    pub fn tuning(mut self, tuning: HyperTuning<F>) -> Self {
        self.0.tuning = tuning;
        self
    }

    /// Set the number of internal hyperparameter optimization restarts
    pub fn n_start(mut self, n_start: usize) -> Self {
        self.0.n_start = n_start;
        self
    }

    /// Set the max number of internal likelihood evaluations during one optimization
    /// Given max_eval has to be greater than [crate::GP_COBYLA_MIN_EVAL] otherwise
    /// max_eval is set to [crate::GP_COBYLA_MIN_EVAL].
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.max_eval = GP_COBYLA_MIN_EVAL.max(max_eval);
        self
    }
}

impl<F: GpFloat> StGpParams<F> {
    /// Check parameters then fit the model on the given data
    pub fn fit(self, data: &crate::SpaceTimeData<F>) -> Result<crate::SpaceTimeGp<F>> {
        self.check()?.fit(data)
    }
}

impl<F: Float> From<StGpValidParams<F>> for StGpParams<F> {
    fn from(valid: StGpValidParams<F>) -> Self {
        StGpParams(valid)
    }
}

impl<F: Float> ParamGuard for StGpParams<F> {
    type Checked = StGpValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.hyper.check()?;
        if !(self.0.jitter.is_finite() && self.0.jitter >= F::zero()) {
            return Err(GpError::InvalidValueError(format!(
                "jitter should be a non negative finite value, got {}",
                self.0.jitter
            )));
        }
        if let HyperTuning::Optimized { lower, upper } = &self.0.tuning {
            lower.check()?;
            upper.check()?;
            if !(lower.noise_variance > F::zero() && self.0.hyper.noise_variance > F::zero()) {
                return Err(GpError::InvalidValueError(
                    "noise variance should be positive when optimized".to_string(),
                ));
            }
            let inside = lower
                .to_array()
                .iter()
                .zip(upper.to_array())
                .all(|(lo, up)| *lo <= up);
            if !inside {
                return Err(GpError::InvalidValueError(
                    "Hyperparameter lower bounds should be less than upper bounds".to_string(),
                ));
            }
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = StGpParams::<f64>::new(4300., 30., 0.25).check().unwrap();
        assert_eq!(params.hyperparameters().noise_variance, DEFAULT_NOISE_VARIANCE);
        assert_eq!(params.hyperparameters().signal_variance, DEFAULT_SIGNAL_VARIANCE);
        assert_eq!(params.jitter(), DEFAULT_JITTER);
        assert_eq!(params.decomposition(), Decomposition::Auto);
        assert_eq!(params.tuning(), &HyperTuning::Fixed);
    }

    #[test]
    fn test_invalid_params() {
        assert!(StGpParams::<f64>::new(0., 30., 0.25).check().is_err());
        assert!(StGpParams::<f64>::new(1., 30., f64::NAN).check().is_err());
        assert!(StGpParams::<f64>::new(1., 30., 1.)
            .noise_variance(-0.1)
            .check()
            .is_err());
        assert!(StGpParams::<f64>::new(1., 30., 1.)
            .jitter(-1e-3)
            .check()
            .is_err());
    }

    #[test]
    fn test_noise_free_params() {
        let fixed = StGpParams::<f64>::new(1., 30., 1.).noise_variance(0.);
        assert!(fixed.check_ref().is_ok());
        let bounds = Hyperparameters::new(0.5, 10., 0.5);
        let optimized = fixed.tuning(HyperTuning::Optimized {
            lower: bounds,
            upper: Hyperparameters::new(2., 60., 2.),
        });
        assert!(optimized.check().is_err());
    }

    #[test]
    fn test_invalid_bounds() {
        let lower = Hyperparameters::new(10., 10., 1.);
        let upper = Hyperparameters::new(1., 100., 2.);
        assert!(StGpParams::<f64>::new(5., 30., 1.)
            .tuning(HyperTuning::Optimized { lower, upper })
            .check()
            .is_err());
    }
}
