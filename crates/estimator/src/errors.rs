use pmkrig_gp::GpError;
use std::time::Duration;
use thiserror::Error;

/// A result type for estimation
pub type Result<T> = std::result::Result<T, EstimateError>;

/// An error raised while preparing or computing estimates
#[derive(Error, Debug)]
pub enum EstimateError {
    /// When the GP model fails
    #[error(transparent)]
    Gp(#[from] GpError),
    /// When a file cannot be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// When a JSON document is malformed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// When an elevation raster cannot be read
    #[error("Npy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
    /// When an area configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// When query inputs are malformed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// When a location cannot be projected to planar coordinates
    #[error("Projection error: {0}")]
    Projection(String),
    /// When there is not enough sensor data to build a model
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    /// When the sensor data store fails
    #[error("Sensor store error: {0}")]
    Store(String),
    /// When the sensor data store does not answer in time
    #[error("Sensor store timed out after {attempts} attempts ({elapsed:?})")]
    StoreTimeout {
        /// Number of fetch attempts
        attempts: usize,
        /// Time spent before giving up
        elapsed: Duration,
    },
}
