//! This library implements a separable spatiotemporal [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression, also known as [Kriging](https://en.wikipedia.org/wiki/Kriging), specialized for
//! sensor networks observed on a regular time grid.
//!
//! The covariance between two observations is the product of a spatial kernel and a temporal kernel,
//! both squared exponential:
//!
//! k((x, e, t), (x', e', t')) = σf² exp(-|x - x'|² / ls²) exp(-(e - e')² / le²) exp(-(t - t')² / lt²)
//!
//! where x are planar coordinates (meters), e elevations (meters) and t times (hours).
//!
//! Training data is a matrix of sensors x time bins. Instead of decomposing the full
//! (n_sensors.n_bins)² covariance matrix, the model decomposes the spatial kernel with a dense
//! symmetric eigensolver and the temporal kernel, taken as circulant on a regular time axis,
//! with a real FFT in O(n log n). The two eigenbases are combined through their Kronecker
//! product which is never materialized.
//!
//! When the time axis is not regular, the model falls back to a dense eigendecomposition of the
//! full space-time kernel.
//!
//! The model is implemented by [SpaceTimeGp] parameterized by [StGpParams].
//!
//! # Example
//!
//! ```no_run
//! use pmkrig_gp::{SpaceTimeData, SpaceTimeGp, TimeAxis};
//! use ndarray::{array, Array2};
//!
//! // two sensors (x, y, elevation) observed on 4 hourly bins
//! let space = array![[0., 0., 1300.], [500., 800., 1320.]];
//! let data = array![[10., 11., 12., 11.], [9., 10., 12., 12.]];
//! let dataset = SpaceTimeData::new(space, TimeAxis::regular(1., 4), data).unwrap();
//!
//! let gp = SpaceTimeGp::<f64>::params(2000., 100., 1.)
//!     .noise_variance(0.1)
//!     .fit(&dataset)
//!     .expect("GP fit");
//!
//! let (mean, var) = gp
//!     .predict_valvar(&array![[250., 400., 1310.]], &array![1.5])
//!     .expect("GP prediction");
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod circulant;
mod errors;
pub mod kernels;
mod parameters;
pub mod spatial;
mod utils;

mod eigen;
mod optimization;

pub use algorithm::*;
pub use eigen::EigenDecomposition;
pub use errors::*;
pub use parameters::*;
pub use utils::{kronecker, TimeAxis};

/// Float type usable by the spatiotemporal GP: a linfa float which can go through an FFT
pub trait GpFloat: linfa::Float + rustfft::FftNum {}

impl<T: linfa::Float + rustfft::FftNum> GpFloat for T {}

/// Default noise variance added to the diagonal of the space-time kernel
pub const DEFAULT_NOISE_VARIANCE: f64 = 0.1;
/// Default prior signal variance
pub const DEFAULT_SIGNAL_VARIANCE: f64 = 1.0;
/// Default jitter added to spatial and temporal kernels diagonal
pub const DEFAULT_JITTER: f64 = 1e-1;
/// Jitter multiplier used when retrying a numerically failing fit
pub const JITTER_ESCALATION: f64 = 10.;
/// Maximum size (n_sensors x n_bins) accepted by the dense decomposition path
pub const MAX_DENSE_SIZE: usize = 3000;

/// Number of internal likelihood optimization restarts
pub const GP_OPTIM_N_START: usize = 4;
/// Minimum of likelihood evaluations during one optimization
pub const GP_COBYLA_MIN_EVAL: usize = 25;
/// Maximum of likelihood evaluations during one optimization
pub const GP_COBYLA_MAX_EVAL: usize = 200;
