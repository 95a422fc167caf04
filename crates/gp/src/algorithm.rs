use crate::circulant::circulant_eigen;
use crate::eigen::{symmetric_eigen, EigenDecomposition};
use crate::errors::{GpError, Result};
use crate::kernels::{SpatialKernel, TemporalKernel};
use crate::optimization::optimize_hyperparameters;
use crate::parameters::{Decomposition, HyperTuning, Hyperparameters, StGpParams, StGpValidParams};
use crate::utils::{kronecker, TimeAxis};
use crate::{GpFloat, JITTER_ESCALATION, MAX_DENSE_SIZE};

use linfa::Float;
use log::{debug, warn};
use ndarray::{Array, Array1, Array2, Array3, ArrayBase, Data, Dimension, Ix1, Ix2};
use ndarray_stats::QuantileExt;
use num_traits::ToPrimitive;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Training data of the spatiotemporal GP: a (n_sensors, n_bins) matrix of observations,
/// sensor locations as (n_sensors, 3) rows of (planar_x, planar_y, elevation) and the time axis.
///
/// Observations are flattened time-major: index `t * n_sensors + s`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SpaceTimeData<F: Float> {
    space: Array2<F>,
    time: TimeAxis<F>,
    data: Array2<F>,
}

impl<F: Float> SpaceTimeData<F> {
    /// Constructor checking shapes and values consistency
    pub fn new(space: Array2<F>, time: TimeAxis<F>, data: Array2<F>) -> Result<Self> {
        if space.ncols() != 3 || space.nrows() == 0 {
            return Err(GpError::InvalidValueError(format!(
                "Sensor locations should be a (n, 3) array with n > 0, got {:?}",
                space.dim()
            )));
        }
        if !time.validate() {
            return Err(GpError::InvalidValueError(
                "Time axis should be non empty, finite and strictly increasing".to_string(),
            ));
        }
        if data.dim() != (space.nrows(), time.len()) {
            return Err(GpError::InvalidValueError(format!(
                "Data shape {:?} does not match {} sensors x {} time bins",
                data.dim(),
                space.nrows(),
                time.len()
            )));
        }
        if space.iter().chain(data.iter()).any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "Sensor locations and data should be finite".to_string(),
            ));
        }
        Ok(SpaceTimeData { space, time, data })
    }

    /// Sensor locations (n_sensors, 3)
    pub fn space(&self) -> &Array2<F> {
        &self.space
    }

    /// Time axis
    pub fn time(&self) -> &TimeAxis<F> {
        &self.time
    }

    /// Observations (n_sensors, n_bins)
    pub fn data(&self) -> &Array2<F> {
        &self.data
    }

    /// Observations flattened time-major
    pub fn flattened(&self) -> Array1<F> {
        self.data.t().iter().cloned().collect()
    }
}

/// Cached factors of `(K + noise.I)⁻¹` used at prediction
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
enum Factors<F: Float> {
    Kronecker {
        /// Eigendecomposition of the jittered spatial kernel
        spatial: EigenDecomposition<F>,
        /// Eigendecomposition of the jittered circulant temporal kernel
        temporal: EigenDecomposition<F>,
        /// `V (Λ + σ²)⁻¹ Vᵗ y` reshaped as (n_sensors, n_bins)
        alpha: Array2<F>,
        /// `1 / (σf² λs_i λt_j + σ²)`
        inv_denom: Array2<F>,
    },
    Dense {
        /// Eigendecomposition of the full scaled space-time kernel
        eigen: EigenDecomposition<F>,
        /// `V (Λ + σ²)⁻¹ Vᵗ y`
        alpha: Array1<F>,
        /// `1 / (λ + σ²)`
        inv_denom: Array1<F>,
    },
}

/// Separable spatiotemporal Gaussian process
///
/// Prior is zero mean with covariance
/// `σf² (Ks + jitter.I) ⊗ (Kt + jitter.I)` where `Ks` is the [SpatialKernel] between sensor
/// locations and `Kt` the [TemporalKernel] between time bins. Observations carry an
/// additional `σ²` noise variance.
///
/// On a regular time axis, `Kt` is taken circulant (wrap-around time distances) so that
/// it is diagonalized by FFT, see [crate::circulant]. Training time windows should then be
/// padded by a few time length scales on each side of the evaluated times.
///
/// ```no_run
/// use pmkrig_gp::{SpaceTimeData, SpaceTimeGp, TimeAxis};
/// use ndarray::array;
///
/// let space = array![[0., 0., 10.], [1000., 0., 10.], [0., 1000., 10.]];
/// let data = array![[12., 12., 12.], [12., 12., 12.], [12., 12., 12.]];
/// let dataset = SpaceTimeData::new(space, TimeAxis::regular(1., 3), data).unwrap();
/// let gp = SpaceTimeGp::<f64>::params(4300., 30., 1.).fit(&dataset).unwrap();
/// let mean = gp.predict(&array![[333., 333., 10.]], &array![1.]).unwrap();
/// ```
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SpaceTimeGp<F: Float> {
    /// Effective parameters (optimized hyperparameters, escalated jitter)
    params: StGpValidParams<F>,
    /// Sensor locations
    space: Array2<F>,
    /// Training time axis
    time: TimeAxis<F>,
    /// Prediction factors
    factors: Factors<F>,
    /// Negative log likelihood of training data
    likelihood: F,
}

impl<F: Float> fmt::Display for SpaceTimeGp<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let h = self.params.hyperparameters();
        write!(
            f,
            "SpaceTimeGp({}, {} sensors x {} bins, length_scales=({}, {}, {}), noise={}, signal={}, jitter={}, nll={})",
            if self.is_kronecker() { "Kronecker" } else { "Dense" },
            self.space.nrows(),
            self.time.len(),
            h.latlon_length_scale,
            h.elevation_length_scale,
            h.time_length_scale,
            h.noise_variance,
            h.signal_variance,
            self.params.jitter(),
            self.likelihood,
        )
    }
}

impl<F: Float> SpaceTimeGp<F> {
    /// Parameters constructor given planar (m), elevation (m) and time (h) length scales
    pub fn params(
        latlon_length_scale: F,
        elevation_length_scale: F,
        time_length_scale: F,
    ) -> StGpParams<F> {
        StGpParams::new(latlon_length_scale, elevation_length_scale, time_length_scale)
    }

    /// Kernel hyperparameters used by the model
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        self.params.hyperparameters()
    }

    /// Jitter actually used, which may have been escalated during fit
    pub fn jitter(&self) -> F {
        self.params.jitter()
    }

    /// Negative log likelihood of the training data
    pub fn likelihood(&self) -> F {
        self.likelihood
    }

    /// Number of sensors and time bins of the training data
    pub fn dims(&self) -> (usize, usize) {
        (self.space.nrows(), self.time.len())
    }

    /// Whether the Kronecker decomposition is used
    pub fn is_kronecker(&self) -> bool {
        matches!(self.factors, Factors::Kronecker { .. })
    }

    /// Predict posterior mean at locations (m, 3) x times (q,) clamped to be non negative.
    /// Returns a (m, q) matrix.
    pub fn predict(
        &self,
        space: &ArrayBase<impl Data<Elem = F>, Ix2>,
        times: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array2<F>> {
        let (mean, _) = self.predict_valvar(space, times)?;
        Ok(mean.mapv(|v| v.max(F::zero())))
    }

    /// Predict posterior variance at locations (m, 3) x times (q,).
    /// Returns a (m, q) matrix.
    pub fn predict_var(
        &self,
        space: &ArrayBase<impl Data<Elem = F>, Ix2>,
        times: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array2<F>> {
        let (_, var) = self.predict_valvar(space, times)?;
        Ok(var)
    }

    /// Predict both posterior mean and variance at locations (m, 3) x times (q,).
    ///
    /// Times are hours relative to the first training bin.
    /// Neither mean nor variance are clamped: variance may be slightly negative due to
    /// round-off errors.
    pub fn predict_valvar(
        &self,
        space: &ArrayBase<impl Data<Elem = F>, Ix2>,
        times: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<(Array2<F>, Array2<F>)> {
        check_test_inputs(space, times)?;
        let h = self.params.hyperparameters();
        let signal = h.signal_variance;
        let ks = SpatialKernel::new(h.latlon_length_scale, h.elevation_length_scale)
            .matrix(space, &self.space);
        let temporal_kernel = TemporalKernel::new(h.time_length_scale);
        let train_times = self.time.coordinates();

        match &self.factors {
            Factors::Kronecker {
                spatial,
                temporal,
                alpha,
                inv_denom,
            } => {
                let period = self.time.period().ok_or_else(|| {
                    GpError::InvalidValueError("Kronecker model needs a regular axis".to_string())
                })?;
                let kt = temporal_kernel.wrapped_matrix(times, &train_times, period);
                let mean = ks.dot(alpha).dot(&kt.t()) * signal;

                let p = ks.dot(&spatial.vectors).mapv(|v| v * v);
                let q = kt.dot(&temporal.vectors).mapv(|v| v * v);
                let quad = p.dot(inv_denom).dot(&q.t());
                let var = quad.mapv(|v| signal - signal * signal * v);
                Ok((mean, var))
            }
            Factors::Dense {
                eigen,
                alpha,
                inv_denom,
            } => {
                let kt = temporal_kernel.matrix(times, &train_times);
                let (m, q) = (space.nrows(), times.len());
                let (ns, nt) = (ks.ncols(), kt.ncols());
                let kstar = Array2::from_shape_fn((m * q, nt * ns), |(r, c)| {
                    signal * ks[[r / q, c % ns]] * kt[[r % q, c / ns]]
                });
                let mean = kstar.dot(alpha);
                let proj = kstar.dot(&eigen.vectors).mapv(|v| v * v);
                let var = proj.dot(inv_denom).mapv(|v| signal - v);
                let reshape = |a: Array1<F>| {
                    a.into_shape((m, q))
                        .map_err(|e| GpError::InvalidValueError(e.to_string()))
                };
                Ok((reshape(mean)?, reshape(var)?))
            }
        }
    }

    /// Predict the posterior covariance between locations (m, 3) at each of the times (q,).
    /// Returns a (q, m, m) array, its diagonals are the variances of [`SpaceTimeGp::predict_var`].
    pub fn predict_cov(
        &self,
        space: &ArrayBase<impl Data<Elem = F>, Ix2>,
        times: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array3<F>> {
        check_test_inputs(space, times)?;
        let h = self.params.hyperparameters();
        let signal = h.signal_variance;
        let spatial_kernel = SpatialKernel::new(h.latlon_length_scale, h.elevation_length_scale);
        let ks = spatial_kernel.matrix(space, &self.space);
        let prior = spatial_kernel.matrix(space, space) * signal;
        let temporal_kernel = TemporalKernel::new(h.time_length_scale);
        let train_times = self.time.coordinates();
        let (m, q) = (space.nrows(), times.len());
        let mut cov = Array3::zeros((q, m, m));

        match &self.factors {
            Factors::Kronecker {
                spatial,
                temporal,
                inv_denom,
                ..
            } => {
                let period = self.time.period().ok_or_else(|| {
                    GpError::InvalidValueError("Kronecker model needs a regular axis".to_string())
                })?;
                let kt = temporal_kernel.wrapped_matrix(times, &train_times, period);
                let a = ks.dot(&spatial.vectors);
                // weights of spatial eigenvectors at each test time
                let w = kt
                    .dot(&temporal.vectors)
                    .mapv(|v| v * v)
                    .dot(&inv_denom.t());
                for (t, mut block) in cov.outer_iter_mut().enumerate() {
                    let aw = &a * &w.row(t);
                    let reduction = aw.dot(&a.t()) * (signal * signal);
                    block.assign(&(&prior - &reduction));
                }
            }
            Factors::Dense {
                eigen, inv_denom, ..
            } => {
                let kt = temporal_kernel.matrix(times, &train_times);
                let (ns, nt) = (ks.ncols(), kt.ncols());
                for (t, mut block) in cov.outer_iter_mut().enumerate() {
                    let kstar = Array2::from_shape_fn((m, nt * ns), |(a, c)| {
                        signal * ks[[a, c % ns]] * kt[[t, c / ns]]
                    });
                    let proj = kstar.dot(&eigen.vectors);
                    let reduction = (&proj * inv_denom).dot(&proj.t());
                    block.assign(&(&prior - &reduction));
                }
            }
        }
        Ok(cov)
    }
}

fn check_test_inputs<F: Float>(
    space: &ArrayBase<impl Data<Elem = F>, Ix2>,
    times: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<()> {
    if space.ncols() != 3 {
        return Err(GpError::InvalidValueError(format!(
            "Test locations should have 3 columns, got {}",
            space.ncols()
        )));
    }
    if space.iter().chain(times.iter()).any(|v| !v.is_finite()) {
        return Err(GpError::InvalidValueError(
            "Test locations and times should be finite".to_string(),
        ));
    }
    Ok(())
}

impl<F: GpFloat> StGpValidParams<F> {
    /// Fit the model on the given data.
    ///
    /// Hyperparameters are optimized first when tuning is [`HyperTuning::Optimized`].
    /// A numerical failure (indefinite kernel, non finite factors) is retried once with
    /// a larger jitter.
    pub fn fit(&self, data: &SpaceTimeData<F>) -> Result<SpaceTimeGp<F>> {
        let params = match self.tuning() {
            HyperTuning::Fixed => self.clone(),
            HyperTuning::Optimized { lower, upper } => {
                let hyper = optimize_hyperparameters(self, data, lower, upper)?;
                self.with_hyperparameters(hyper)
            }
        };
        match params.fit_fixed(data) {
            Err(err) if err.is_numerical() => {
                let jitter = if params.jitter() > F::zero() {
                    params.jitter() * F::cast(JITTER_ESCALATION)
                } else {
                    F::cast(1e-6)
                };
                warn!("GP fit failed ({err}), retrying with jitter {jitter}");
                params.with_jitter(jitter).fit_fixed(data)
            }
            res => res,
        }
    }

    /// Fit with current hyperparameters
    pub(crate) fn fit_fixed(&self, data: &SpaceTimeData<F>) -> Result<SpaceTimeGp<F>> {
        let kronecker = match self.decomposition() {
            Decomposition::Auto => data.time().is_regular(),
            Decomposition::Kronecker => {
                if !data.time().is_regular() {
                    return Err(GpError::InvalidValueError(
                        "Kronecker decomposition requires a regular time axis".to_string(),
                    ));
                }
                true
            }
            Decomposition::Dense => false,
        };
        let now = Instant::now();
        let (factors, likelihood) = if kronecker {
            self.kronecker_factors(data)?
        } else {
            self.dense_factors(data)?
        };
        debug!(
            "GP fit ({} decomposition, {:?}) in {:?}",
            if kronecker { "Kronecker" } else { "dense" },
            data.data().dim(),
            now.elapsed()
        );
        if !likelihood.is_finite() {
            return Err(GpError::NonFiniteResult(format!(
                "negative log likelihood is {likelihood}"
            )));
        }
        Ok(SpaceTimeGp {
            params: self.clone(),
            space: data.space().to_owned(),
            time: data.time().clone(),
            factors,
            likelihood,
        })
    }

    fn kronecker_factors(&self, data: &SpaceTimeData<F>) -> Result<(Factors<F>, F)> {
        let h = self.hyperparameters();
        let (spacing, n) = match data.time() {
            TimeAxis::Regular { spacing, len } => (*spacing, *len),
            TimeAxis::Irregular(_) => {
                return Err(GpError::InvalidValueError(
                    "Kronecker decomposition requires a regular time axis".to_string(),
                ))
            }
        };
        let spatial = crate::spatial::spatial_eigen(
            data.space(),
            &SpatialKernel::new(h.latlon_length_scale, h.elevation_length_scale),
            self.jitter(),
        )?;
        let temporal = circulant_eigen(n, h.time_length_scale / spacing)?.shifted(self.jitter());

        let denom = Array2::from_shape_fn((spatial.len(), temporal.len()), |(i, j)| {
            h.signal_variance * spatial.values[i] * temporal.values[j] + h.noise_variance
        });
        check_positive(&denom, self.jitter())?;

        // Vᵗ y with V = Vt ⊗ Vs and y flattened time-major
        let proj = spatial.vectors.t().dot(data.data()).dot(&temporal.vectors);
        let z = &proj / &denom;
        let alpha = spatial.vectors.dot(&z).dot(&temporal.vectors.t());
        let likelihood = negative_log_likelihood(denom.iter(), (&proj * &z).sum());

        Ok((
            Factors::Kronecker {
                spatial,
                temporal,
                alpha,
                inv_denom: denom.mapv(|v| F::one() / v),
            },
            likelihood,
        ))
    }

    fn dense_factors(&self, data: &SpaceTimeData<F>) -> Result<(Factors<F>, F)> {
        let (ns, nt) = data.data().dim();
        if ns * nt > MAX_DENSE_SIZE {
            return Err(GpError::InvalidValueError(format!(
                "Dense decomposition limited to {MAX_DENSE_SIZE} observations, got {}",
                ns * nt
            )));
        }
        let h = self.hyperparameters();
        let times = data.time().coordinates();
        let ks = SpatialKernel::new(h.latlon_length_scale, h.elevation_length_scale)
            .matrix(data.space(), data.space())
            + Array2::<F>::eye(ns) * self.jitter();
        let kt = TemporalKernel::new(h.time_length_scale).matrix(&times, &times)
            + Array2::<F>::eye(nt) * self.jitter();
        let k = kronecker(&kt, &ks) * h.signal_variance;
        let eigen = symmetric_eigen(k)?;

        let denom = eigen.values.mapv(|v| v + h.noise_variance);
        check_positive(&denom, self.jitter())?;

        let proj = eigen.vectors.t().dot(&data.flattened());
        let z = &proj / &denom;
        let alpha = eigen.vectors.dot(&z);
        let likelihood = negative_log_likelihood(denom.iter(), proj.dot(&z));

        Ok((
            Factors::Dense {
                eigen,
                alpha,
                inv_denom: denom.mapv(|v| F::one() / v),
            },
            likelihood,
        ))
    }
}

/// `0.5 Σ log(λ + σ²) + 0.5 yᵗα + 0.5 N log(2π)`
fn negative_log_likelihood<'a, F: Float>(denom: impl Iterator<Item = &'a F>, y_alpha: F) -> F {
    let half = F::cast(0.5);
    let (n, log_det) = denom.fold((0usize, F::zero()), |(n, acc), v| (n + 1, acc + v.ln()));
    half * log_det
        + half * y_alpha
        + half * F::cast(n) * F::cast((2. * std::f64::consts::PI).ln())
}

fn check_positive<D: Dimension, F: Float>(
    denom: &Array<F, D>,
    jitter: F,
) -> Result<()> {
    let min = denom.min().map(|v| *v).unwrap_or_else(|_| F::nan());
    if min > F::zero() {
        Ok(())
    } else {
        Err(GpError::NotPositiveDefinite {
            min_eigenvalue: min.to_f64().unwrap_or(f64::NAN),
            jitter: jitter.to_f64().unwrap_or(f64::NAN),
        })
    }
}
