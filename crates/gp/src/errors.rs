use thiserror::Error;

/// A result type for spatiotemporal GP algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building or evaluating a [`SpaceTimeGp`](crate::SpaceTimeGp)
#[derive(Error, Debug)]
pub enum GpError {
    /// When linear algebra computation fails
    #[cfg(feature = "blas")]
    #[error("Linalg BLAS error: {0}")]
    LinalgBlasError(#[from] ndarray_linalg::error::LinalgError),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When a kernel matrix stays indefinite after jitter
    #[error("Kernel not positive definite: min eigenvalue {min_eigenvalue} with jitter {jitter}")]
    NotPositiveDefinite {
        /// Smallest eigenvalue found
        min_eigenvalue: f64,
        /// Jitter used on the diagonal
        jitter: f64,
    },
    /// When the fitted model yields NaN or infinite values
    #[error("Non finite result: {0}")]
    NonFiniteResult(String),
    /// When hyperparameter optimization fails
    #[error("Optimization error: {0}")]
    OptimizationError(String),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}

impl GpError {
    /// Whether retrying with a larger jitter may recover from this error
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            GpError::NotPositiveDefinite { .. } | GpError::NonFiniteResult(_)
        )
    }
}
