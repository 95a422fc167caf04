use crate::errors::Result;
use linfa::Float;
use ndarray::{Array1, Array2, Axis};
use ndarray_stats::QuantileExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

#[cfg(not(feature = "blas"))]
use linfa_linalg::eigh::EighInto;
#[cfg(feature = "blas")]
use {linfa::dataset::WithLapack, linfa::dataset::WithoutLapack, ndarray_linalg::Eigh};

/// Eigendecomposition `K = V diag(values) Vᵗ` of a symmetric kernel matrix
/// where columns of `vectors` are orthonormal eigenvectors.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct EigenDecomposition<F: Float> {
    /// Eigenvalues
    pub values: Array1<F>,
    /// Eigenvectors as columns
    pub vectors: Array2<F>,
}

impl<F: Float> EigenDecomposition<F> {
    /// Size of the decomposed matrix
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the decomposed matrix is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Smallest eigenvalue
    pub fn min_value(&self) -> F {
        self.values.min().map(|v| *v).unwrap_or_else(|_| F::nan())
    }

    /// Shift every eigenvalue by `shift`, ie decomposition of `K + shift.I`
    pub fn shifted(mut self, shift: F) -> Self {
        self.values.mapv_inplace(|v| v + shift);
        self
    }

    /// Rebuild the dense matrix `V diag(values) Vᵗ`
    pub fn reconstruct(&self) -> Array2<F> {
        let scaled = &self.vectors * &self.values.view().insert_axis(Axis(0));
        scaled.dot(&self.vectors.t())
    }
}

/// Dense eigendecomposition of a symmetric matrix
#[cfg(not(feature = "blas"))]
pub(crate) fn symmetric_eigen<F: Float>(matrix: Array2<F>) -> Result<EigenDecomposition<F>> {
    let (values, vectors) = matrix.eigh_into()?;
    Ok(EigenDecomposition { values, vectors })
}

/// Dense eigendecomposition of a symmetric matrix
#[cfg(feature = "blas")]
pub(crate) fn symmetric_eigen<F: Float>(matrix: Array2<F>) -> Result<EigenDecomposition<F>> {
    let (values, vectors) = matrix.with_lapack().eigh(ndarray_linalg::UPLO::Lower)?;
    Ok(EigenDecomposition {
        values: values.mapv(F::cast),
        vectors: vectors.without_lapack(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_symmetric_eigen_reconstruct() {
        let m = array![[2., 1., 0.], [1., 3., 1.], [0., 1., 4.]];
        let eig = symmetric_eigen(m.clone()).unwrap();
        assert_eq!(eig.len(), 3);
        assert_abs_diff_eq!(eig.reconstruct(), m, epsilon = 1e-10);
        assert_abs_diff_eq!(
            eig.vectors.t().dot(&eig.vectors),
            Array2::eye(3),
            epsilon = 1e-10
        );
        assert!(eig.min_value() > 0.);
    }

    #[test]
    fn test_shifted() {
        let eig = symmetric_eigen(array![[1., 0.], [0., 2.]]).unwrap().shifted(0.5);
        assert_abs_diff_eq!(eig.reconstruct(), array![[1.5, 0.], [0., 2.5]], epsilon = 1e-12);
    }
}
