//! PM2.5 concentration estimates from low cost sensor networks.
//!
//! Readings fetched from a [SensorStore] are corrected with the area
//! [correction factors](corrections::CorrectionTable), projected to UTM coordinates and binned
//! into a sensors x time bins [matrix](matrix::SensorMatrix). A separable spatiotemporal
//! Gaussian process ([pmkrig_gp::SpaceTimeGp]) is fitted on that matrix and evaluated at the
//! query locations and times. Long query ranges are split into padded [chunks](chunker)
//! estimated independently, in parallel.
//!
//! Area specific settings (boundary, timezone, length scales, correction factors, elevation
//! raster) are described by an [AreaConfig], usually loaded at startup in an [AreaRegistry].
//!
//! # Example
//!
//! ```no_run
//! use pmkrig::{AreaRegistry, CancellationToken, Estimator, EstimatorConfig, MemoryStore,
//!              QueryLocation, TimeRange};
//!
//! let registry = AreaRegistry::from_file("areas.json").unwrap();
//! let area = registry.by_id("slc_ut").unwrap();
//! let store = MemoryStore::from_json_file("readings.json").unwrap();
//! let estimator = Estimator::new(EstimatorConfig::default(), store).unwrap();
//!
//! let range = TimeRange::new(
//!     area.parse_time("2023-01-01 00:00:00").unwrap(),
//!     area.parse_time("2023-01-02 00:00:00").unwrap(),
//! );
//! let estimates = estimator
//!     .compute_estimates(
//!         area,
//!         &range.sample(0.5).unwrap(),
//!         &[QueryLocation::new(40.76, -111.89)],
//!         &CancellationToken::new(),
//!     )
//!     .unwrap();
//! println!("{}", estimates.predictions);
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod area;
pub mod cancel;
pub mod chunker;
mod config;
pub mod corrections;
pub mod elevation;
mod errors;
mod estimator;
pub mod matrix;
pub mod projection;
pub mod schedule;
pub mod store;
mod types;

pub use area::{AreaConfig, AreaRegistry};
pub use cancel::CancellationToken;
pub use config::*;
pub use errors::*;
pub use estimator::*;
pub use store::{MemoryStore, RetryPolicy, RetryingStore, SensorStore};
pub use types::*;
