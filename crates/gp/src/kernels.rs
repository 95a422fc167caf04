//! A module for the squared exponential kernels used by the spatiotemporal model.
//!
//! The space-time covariance is separable:
//! * a spatial kernel, product of a planar (x, y) kernel and an elevation kernel,
//! * a temporal kernel, evaluated either on plain or on wrap-around time distances.
//!
//! Kernels are unit variance, the signal variance is applied by the model.

use crate::utils::{pairwise_sq_distances, time_distances, wrapped_time_distances};
use linfa::Float;
use ndarray::{s, Array2, ArrayBase, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Squared exponential kernel `k(d) = exp(-(d / l)²)` with length scale `l`
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SquaredExponential<F: Float> {
    length_scale: F,
}

impl<F: Float> SquaredExponential<F> {
    /// Constructor
    pub fn new(length_scale: F) -> Self {
        SquaredExponential { length_scale }
    }

    /// Length scale in the units of the distances it is applied to
    pub fn length_scale(&self) -> F {
        self.length_scale
    }

    /// Kernel value at distance `d`
    pub fn value(&self, d: F) -> F {
        let r = d / self.length_scale;
        F::exp(-r * r)
    }

    /// Kernel matrix from a matrix of squared distances
    pub fn from_sq_distances(&self, d2: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let l2 = self.length_scale * self.length_scale;
        d2.mapv(|v| F::exp(-v / l2))
    }

    /// Kernel matrix from a matrix of distances
    pub fn from_distances(&self, d: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        d.mapv(|v| self.value(v))
    }
}

impl<F: Float> fmt::Display for SquaredExponential<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential(l={})", self.length_scale)
    }
}

/// Spatial kernel on (planar_x, planar_y, elevation) rows
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SpatialKernel<F: Float> {
    planar: SquaredExponential<F>,
    elevation: SquaredExponential<F>,
}

impl<F: Float> SpatialKernel<F> {
    /// Constructor given planar and elevation length scales (meters)
    pub fn new(latlon_length_scale: F, elevation_length_scale: F) -> Self {
        SpatialKernel {
            planar: SquaredExponential::new(latlon_length_scale),
            elevation: SquaredExponential::new(elevation_length_scale),
        }
    }

    /// Kernel matrix between rows of `x` (n, 3) and rows of `x2` (m, 3)
    ///
    /// *Panics* if inputs do not have 3 columns
    pub fn matrix(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Array2<F> {
        assert!(x.ncols() == 3 && x2.ncols() == 3);
        let planar = pairwise_sq_distances(&x.slice(s![.., 0..2]), &x2.slice(s![.., 0..2]));
        let elevation = pairwise_sq_distances(&x.slice(s![.., 2..3]), &x2.slice(s![.., 2..3]));
        self.planar.from_sq_distances(&planar) * self.elevation.from_sq_distances(&elevation)
    }
}

impl<F: Float> fmt::Display for SpatialKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "planar {} x elevation {}", self.planar, self.elevation)
    }
}

/// Temporal kernel on time coordinates in hours
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct TemporalKernel<F: Float>(SquaredExponential<F>);

impl<F: Float> TemporalKernel<F> {
    /// Constructor given time length scale (hours)
    pub fn new(time_length_scale: F) -> Self {
        TemporalKernel(SquaredExponential::new(time_length_scale))
    }

    /// Underlying 1-D kernel
    pub fn kernel(&self) -> &SquaredExponential<F> {
        &self.0
    }

    /// Kernel matrix on plain time distances
    pub fn matrix(
        &self,
        t: &ArrayBase<impl Data<Elem = F>, Ix1>,
        t2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        self.0.from_distances(&time_distances(t, t2))
    }

    /// Kernel matrix on wrap-around time distances of a cycle of length `period`
    pub fn wrapped_matrix(
        &self,
        t: &ArrayBase<impl Data<Elem = F>, Ix1>,
        t2: &ArrayBase<impl Data<Elem = F>, Ix1>,
        period: F,
    ) -> Array2<F> {
        self.0
            .from_distances(&wrapped_time_distances(t, t2, period))
    }
}

impl<F: Float> fmt::Display for TemporalKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "time {}", self.0)
    }
}
