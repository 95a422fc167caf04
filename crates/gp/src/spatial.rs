//! Diagonalization of the spatial kernel between sensor locations.
//!
//! Sensors are irregularly placed, so the kernel is decomposed with a dense symmetric eigensolver
//! after adding a jitter on the diagonal to cope with near-duplicate locations.

use crate::eigen::{symmetric_eigen, EigenDecomposition};
use crate::errors::{GpError, Result};
use crate::kernels::SpatialKernel;
use crate::GpFloat;
use log::debug;
use ndarray::{Array2, ArrayBase, Data, Ix2};
use num_traits::ToPrimitive;
use std::time::Instant;

/// Eigendecomposition of `K(space, space) + jitter.I`.
///
/// `space` is a (n_sensors, 3) array of (planar_x, planar_y, elevation) rows.
/// Fails with [`GpError::NotPositiveDefinite`] if the smallest eigenvalue is not positive.
pub fn spatial_eigen<F: GpFloat>(
    space: &ArrayBase<impl Data<Elem = F>, Ix2>,
    kernel: &SpatialKernel<F>,
    jitter: F,
) -> Result<EigenDecomposition<F>> {
    if space.nrows() == 0 || space.ncols() != 3 {
        return Err(GpError::InvalidValueError(format!(
            "Sensor locations should be a (n, 3) array with n > 0, got {:?}",
            space.dim()
        )));
    }
    let now = Instant::now();
    let n = space.nrows();
    let k = kernel.matrix(space, space) + Array2::<F>::eye(n) * jitter;
    let eig = symmetric_eigen(k)?;
    let min_eigenvalue = eig.min_value();
    debug!(
        "Spatial kernel ({n} sensors) diagonalized in {:?}, min eigenvalue {min_eigenvalue}",
        now.elapsed()
    );
    if !(min_eigenvalue > F::zero()) {
        return Err(GpError::NotPositiveDefinite {
            min_eigenvalue: min_eigenvalue.to_f64().unwrap_or(f64::NAN),
            jitter: jitter.to_f64().unwrap_or(f64::NAN),
        });
    }
    Ok(eig)
}
