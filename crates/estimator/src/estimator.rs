use crate::area::AreaConfig;
use crate::cancel::{CancelReason, CancellationToken};
use crate::chunker::{split_queries, QueryChunk};
use crate::config::{EstimatorConfig, VARIANCE_TOLERANCE};
use crate::errors::{EstimateError, Result};
use crate::matrix::{build_matrix, Observation};
use crate::projection::UtmProjection;
use crate::schedule::LengthScales;
use crate::store::{RetryingStore, SensorStore};
use crate::types::{BoundingBox, QueryLocation};

use chrono::{DateTime, Utc};
use env_logger::{Builder, Env};
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, Array3};
use pmkrig_gp::{SpaceTimeGp, JITTER_ESCALATION};
use rayon::prelude::*;
use std::fmt;
use std::ops::Range;
use std::time::Instant;

/// Outcome of the estimation at one query time
#[derive(Clone, Debug, PartialEq)]
pub enum EstimateStatus {
    /// Estimated from a fitted model
    Success,
    /// The store returned no reading around the query
    ZeroSensorData,
    /// No length scales configured for the query time
    LengthScaleMissing,
    /// Query inputs cannot be used
    InvalidQuery(String),
    /// Not enough usable readings to fit a model
    InsufficientData(String),
    /// The model could not be fitted or evaluated
    ModelFailure(String),
    /// The sensor store failed
    StoreFailure(String),
    /// The sensor store did not answer in time
    StoreTimeout,
    /// The request deadline passed before the estimation started
    TimedOut,
    /// The request was cancelled before the estimation started
    Cancelled,
}

impl EstimateStatus {
    /// Whether predictions come from a fitted model
    pub fn is_estimated(&self) -> bool {
        matches!(self, EstimateStatus::Success)
    }
}

impl fmt::Display for EstimateStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EstimateStatus::Success => write!(f, "Success"),
            EstimateStatus::ZeroSensorData => write!(f, "Zero sensor data"),
            EstimateStatus::LengthScaleMissing => write!(f, "Length scale parameter error"),
            EstimateStatus::InvalidQuery(msg) => write!(f, "Invalid query: {msg}"),
            EstimateStatus::InsufficientData(msg) => write!(f, "Insufficient sensor data: {msg}"),
            EstimateStatus::ModelFailure(msg) => write!(f, "Model failure: {msg}"),
            EstimateStatus::StoreFailure(msg) => write!(f, "Sensor data query failure: {msg}"),
            EstimateStatus::StoreTimeout => write!(f, "Sensor data query timed out"),
            EstimateStatus::TimedOut => write!(f, "Estimation timed out"),
            EstimateStatus::Cancelled => write!(f, "Estimation cancelled"),
        }
    }
}

/// Estimates at query locations x query times
#[derive(Clone, Debug, PartialEq)]
pub struct Estimates {
    /// Concentrations (n_locations, n_times), never negative
    pub predictions: Array2<f64>,
    /// Posterior variances (n_locations, n_times), infinite where estimation failed
    pub variances: Array2<f64>,
    /// Posterior covariances between locations (n_times, n_locations, n_locations) when
    /// requested, with infinite diagonals where estimation failed
    pub covariances: Option<Array3<f64>>,
    /// Elevation of each query location
    pub elevations: Array1<f64>,
    /// Status of each query time
    pub status: Vec<EstimateStatus>,
    /// Whether area correction factors were applied to readings
    pub corrections_applied: bool,
    /// Aggregation interval in hours of time aggregated estimates
    pub aggregation_hours: Option<f64>,
}

impl Estimates {
    fn failed(
        n_times: usize,
        elevations: Array1<f64>,
        status: EstimateStatus,
        config: &EstimatorConfig,
    ) -> Self {
        let n_locations = elevations.len();
        let dim = (n_locations, n_times);
        Estimates {
            predictions: Array2::zeros(dim),
            variances: Array2::from_elem(dim, f64::INFINITY),
            covariances: config
                .full_covariance
                .then(|| failed_covariances(n_times, n_locations)),
            elevations,
            status: vec![status; n_times],
            corrections_applied: config.apply_corrections,
            aggregation_hours: config.aggregation_hours,
        }
    }

    /// Human readable status of each query time
    pub fn status_messages(&self) -> Vec<String> {
        let aggregation = self
            .aggregation_hours
            .map(|h| format!(", aggregation of {h} hours"))
            .unwrap_or_default();
        let corrections = if self.corrections_applied {
            ", correction factors applied"
        } else {
            ", no correction applied"
        };
        self.status
            .iter()
            .map(|s| format!("{s}{aggregation}{corrections}"))
            .collect()
    }

    /// Whether every query time has been estimated
    pub fn is_complete(&self) -> bool {
        self.status.iter().all(|s| s.is_estimated())
    }
}

/// Result block of one chunk
struct ChunkEstimate {
    queries: Range<usize>,
    posterior: Posterior,
    status: EstimateStatus,
}

impl ChunkEstimate {
    fn failed(
        chunk: &QueryChunk,
        n_locations: usize,
        full_covariance: bool,
        status: EstimateStatus,
    ) -> Self {
        let dim = (n_locations, chunk.len());
        ChunkEstimate {
            queries: chunk.queries.clone(),
            posterior: Posterior {
                mean: Array2::zeros(dim),
                var: Array2::from_elem(dim, f64::INFINITY),
                cov: full_covariance.then(|| failed_covariances(chunk.len(), n_locations)),
                jitter: 0.,
            },
            status,
        }
    }
}

/// Posterior moments at the query locations x chunk times
struct Posterior {
    mean: Array2<f64>,
    var: Array2<f64>,
    cov: Option<Array3<f64>>,
    /// Jitter of the model which produced them
    jitter: f64,
}

/// Covariances of failed estimates: infinite variances, no correlation
fn failed_covariances(n_times: usize, n_locations: usize) -> Array3<f64> {
    Array3::from_shape_fn((n_times, n_locations, n_locations), |(_, a, b)| {
        if a == b {
            f64::INFINITY
        } else {
            0.
        }
    })
}

/// Request inputs shared by every chunk
struct Request<'a> {
    area: &'a AreaConfig,
    scales: LengthScales,
    projection: UtmProjection,
    bbox: BoundingBox,
    query_space: Array2<f64>,
    query_times: &'a [DateTime<Utc>],
    cancel: &'a CancellationToken,
}

/// PM2.5 estimation from the readings of a sensor store
///
/// Each request is split into time chunks (see [crate::chunker]). For every chunk, readings
/// around the query locations are fetched over the padded chunk window, corrected, projected
/// and binned into a sensor matrix on which a [SpaceTimeGp] is fitted and evaluated.
/// A failing chunk yields zero predictions with infinite variances and a status telling why,
/// other chunks are not affected.
pub struct Estimator<S: SensorStore> {
    config: EstimatorConfig,
    store: RetryingStore<S>,
}

impl<S: SensorStore + 'static> Estimator<S> {
    /// Constructor, the store is accessed with the configured retry policy.
    ///
    /// Also initializes logging filtered by the `PMKRIG_LOG` environment variable
    /// (`info` by default) if no logger is set yet.
    pub fn new(config: EstimatorConfig, store: S) -> Result<Self> {
        let env = Env::new().filter_or("PMKRIG_LOG", "info");
        let mut builder = Builder::from_env(env);
        let builder = builder.target(env_logger::Target::Stdout);
        builder.try_init().ok();

        config.validate()?;
        let store = RetryingStore::new(store, config.retry);
        Ok(Estimator { config, store })
    }

    /// Estimation settings
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate concentrations at `locations` x `query_times` in `area`.
    ///
    /// `query_times` must be sorted. Malformed inputs (no time, no location, unsorted times,
    /// invalid coordinates) are errors; failures of the estimation itself are reported in
    /// the statuses of the affected query times.
    pub fn compute_estimates(
        &self,
        area: &AreaConfig,
        query_times: &[DateTime<Utc>],
        locations: &[QueryLocation],
        cancel: &CancellationToken,
    ) -> Result<Estimates> {
        if query_times.is_empty() || locations.is_empty() {
            return Err(EstimateError::InvalidQuery(format!(
                "estimates need query times and locations, got {} times and {} locations",
                query_times.len(),
                locations.len()
            )));
        }
        if query_times.windows(2).any(|w| w[1] < w[0]) {
            return Err(EstimateError::InvalidQuery(
                "query times should be sorted".to_string(),
            ));
        }
        locations.iter().try_for_each(|l| l.validate())?;

        let now = Instant::now();
        let n_times = query_times.len();
        let elevations: Array1<f64> = locations
            .iter()
            .map(|l| {
                l.elevation
                    .unwrap_or_else(|| area.elevation_at(l.longitude, l.latitude))
            })
            .collect();

        let Some(scales) = area.length_scales_for(&query_times[0]) else {
            warn!(
                "No length scales in area {} for {}",
                area.id(),
                query_times[0]
            );
            return Ok(Estimates::failed(
                n_times,
                elevations,
                EstimateStatus::LengthScaleMissing,
                &self.config,
            ));
        };
        debug!("Using length scales {scales:?}");

        let projected = UtmProjection::for_location(locations[0].latitude, locations[0].longitude)
            .and_then(|projection| {
                let mut query_space = Array2::zeros((locations.len(), 3));
                let rows = query_space.rows_mut().into_iter();
                for ((mut row, l), e) in rows.zip(locations).zip(&elevations) {
                    let (x, y) = projection.to_planar(l.latitude, l.longitude)?;
                    row.assign(&ndarray::arr1(&[x, y, *e]));
                }
                Ok((projection, query_space))
            });
        let (projection, query_space) = match projected {
            Ok(projected) => projected,
            Err(err) => {
                warn!("Failure to convert query locations: {err}");
                return Ok(Estimates::failed(
                    n_times,
                    elevations,
                    EstimateStatus::InvalidQuery(err.to_string()),
                    &self.config,
                ));
            }
        };

        let chunks = split_queries(query_times, scales.time, &self.config.chunks)?;
        let bbox = BoundingBox::around_locations(
            locations,
            self.config.space_padding_factor * scales.space,
        )
        .ok_or_else(|| EstimateError::InvalidQuery("no query location".to_string()))?;
        let request = Request {
            area,
            scales,
            projection,
            bbox,
            query_space,
            query_times,
            cancel,
        };

        let results: Vec<ChunkEstimate> = if self.config.parallel {
            chunks
                .par_iter()
                .map(|chunk| self.run_chunk(&request, chunk))
                .collect()
        } else {
            chunks
                .iter()
                .map(|chunk| self.run_chunk(&request, chunk))
                .collect()
        };

        let Estimates {
            mut predictions,
            mut variances,
            mut covariances,
            mut status,
            ..
        } = Estimates::failed(n_times, elevations.clone(), EstimateStatus::Success, &self.config);
        for result in results {
            let posterior = result.posterior;
            predictions
                .slice_mut(s![.., result.queries.clone()])
                .assign(&posterior.mean);
            variances
                .slice_mut(s![.., result.queries.clone()])
                .assign(&posterior.var);
            if let (Some(all), Some(cov)) = (covariances.as_mut(), posterior.cov) {
                all.slice_mut(s![result.queries.clone(), .., ..]).assign(&cov);
            }
            status[result.queries].fill(result.status);
        }

        let lowest = predictions.iter().copied().fold(f64::INFINITY, f64::min);
        if lowest < self.config.sanity_floor {
            warn!(
                "Got estimate {lowest} below level {}",
                self.config.sanity_floor
            );
        }
        predictions.mapv_inplace(|v| v.max(0.));

        info!(
            "Estimated {} locations x {} times in {} chunks ({:?})",
            locations.len(),
            n_times,
            chunks.len(),
            now.elapsed()
        );
        Ok(Estimates {
            predictions,
            variances,
            covariances,
            elevations,
            status,
            corrections_applied: self.config.apply_corrections,
            aggregation_hours: self.config.aggregation_hours,
        })
    }

    fn run_chunk(&self, request: &Request, chunk: &QueryChunk) -> ChunkEstimate {
        let n_locations = request.query_space.nrows();
        let full = self.config.full_covariance;
        if let Some(reason) = request.cancel.reason() {
            let status = match reason {
                CancelReason::Cancelled => EstimateStatus::Cancelled,
                CancelReason::DeadlineExceeded => EstimateStatus::TimedOut,
            };
            debug!("Chunk {} skipped: {status}", chunk.index);
            return ChunkEstimate::failed(chunk, n_locations, full, status);
        }
        match self.estimate_chunk(request, chunk) {
            Ok(estimate) => estimate,
            Err(err) => {
                let status = match err {
                    EstimateError::StoreTimeout { .. } => EstimateStatus::StoreTimeout,
                    EstimateError::Store(msg) => EstimateStatus::StoreFailure(msg),
                    EstimateError::InsufficientData(msg) => EstimateStatus::InsufficientData(msg),
                    EstimateError::Projection(msg) | EstimateError::InvalidQuery(msg) => {
                        EstimateStatus::InvalidQuery(msg)
                    }
                    err => EstimateStatus::ModelFailure(err.to_string()),
                };
                warn!(
                    "Chunk {} [{}, {}] failed: {status}",
                    chunk.index, chunk.window.start, chunk.window.end
                );
                ChunkEstimate::failed(chunk, n_locations, full, status)
            }
        }
    }

    /// Readings of the padded chunk window, corrected and projected
    fn observations(&self, request: &Request, chunk: &QueryChunk) -> Result<Vec<Observation>> {
        let readings = self.store.fetch(&request.bbox, &chunk.padded)?;
        let n_readings = readings.len();
        let mut n_corrected = 0;
        let mut observations = Vec::with_capacity(n_readings);
        for reading in readings {
            if let Err(err) = reading.validate() {
                debug!("Reading skipped: {err}");
                continue;
            }
            let value = if self.config.apply_corrections {
                let correction = request.area.correction_table().correct_reading(&reading);
                if correction.is_applied() {
                    n_corrected += 1;
                }
                correction.value
            } else {
                reading.value
            };
            let elevation = reading
                .elevation
                .unwrap_or_else(|| request.area.elevation_at(reading.longitude, reading.latitude));
            let (x, y) = request
                .projection
                .to_planar(reading.latitude, reading.longitude)?;
            observations.push(Observation {
                sensor_id: reading.sensor_id,
                position: [x, y, elevation],
                timestamp: reading.timestamp,
                value,
            });
        }
        debug!(
            "Chunk {}: {} readings, {} usable, {} corrected",
            chunk.index,
            n_readings,
            observations.len(),
            n_corrected
        );
        Ok(observations)
    }

    fn estimate_chunk(&self, request: &Request, chunk: &QueryChunk) -> Result<ChunkEstimate> {
        let now = Instant::now();
        let n_locations = request.query_space.nrows();
        let full = self.config.full_covariance;
        let observations = self.observations(request, chunk)?;
        if observations.is_empty() {
            warn!(
                "Chunk {}: zero sensor data in [{}, {}]",
                chunk.index, chunk.padded.start, chunk.padded.end
            );
            return Ok(ChunkEstimate::failed(
                chunk,
                n_locations,
                full,
                EstimateStatus::ZeroSensorData,
            ));
        }
        let (matrix_config, noise_variance) = self.config.binning();
        let matrix = build_matrix(&observations, &chunk.padded, &matrix_config)?;
        let dataset = matrix.dataset()?;

        let times: Array1<f64> = request.query_times[chunk.queries.clone()]
            .iter()
            .map(|t| matrix.time_offset_hours(t))
            .collect();
        let scales = request.scales;
        let params = SpaceTimeGp::params(scales.space, scales.elevation, scales.time)
            .noise_variance(noise_variance)
            .signal_variance(self.config.signal_variance);

        let posterior = predict_with_escalation(self.config.jitter, |jitter| {
            let gp = params.clone().jitter(jitter).fit(&dataset)?;
            let (mean, var) = gp.predict_valvar(&request.query_space, &times)?;
            let cov = if full {
                Some(gp.predict_cov(&request.query_space, &times)?)
            } else {
                None
            };
            Ok(Posterior {
                mean,
                var,
                cov,
                jitter: gp.jitter(),
            })
        })?;
        let Some(posterior) = posterior else {
            warn!(
                "Chunk {}: variances remain negative or NaN after jitter escalation",
                chunk.index
            );
            return Ok(ChunkEstimate::failed(
                chunk,
                n_locations,
                full,
                EstimateStatus::InsufficientData(
                    "posterior variances are negative or NaN".to_string(),
                ),
            ));
        };
        debug!(
            "Chunk {} ({} sensors x {} bins, {} queries) estimated in {:?}",
            chunk.index,
            matrix.sensor_ids().len(),
            matrix.n_bins(),
            chunk.len(),
            now.elapsed()
        );
        Ok(ChunkEstimate {
            queries: chunk.queries.clone(),
            posterior,
            status: EstimateStatus::Success,
        })
    }
}

/// Posterior given by `predict` at `jitter`, predicted again once with an escalated jitter
/// when variances are negative or NaN. `None` when they still are.
fn predict_with_escalation<P>(jitter: f64, mut predict: P) -> Result<Option<Posterior>>
where
    P: FnMut(f64) -> Result<Posterior>,
{
    let posterior = predict(jitter)?;
    if !has_bad_variance(&posterior.var) {
        return Ok(Some(posterior));
    }
    let escalated = if posterior.jitter > 0. {
        posterior.jitter * JITTER_ESCALATION
    } else {
        1e-6
    };
    warn!("Negative or NaN variances, refit with jitter {escalated}");
    let posterior = predict(escalated)?;
    Ok((!has_bad_variance(&posterior.var)).then_some(posterior))
}

fn has_bad_variance(var: &Array2<f64>) -> bool {
    var.iter().any(|v| v.is_nan() || *v < -VARIANCE_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn posterior(var: Array2<f64>, jitter: f64) -> Posterior {
        Posterior {
            mean: Array2::from_elem(var.dim(), 10.),
            var,
            cov: None,
            jitter,
        }
    }

    #[test]
    fn test_status_messages() {
        let config = EstimatorConfig::default().full_covariance(true);
        let estimates = Estimates::failed(2, Array1::zeros(3), EstimateStatus::ZeroSensorData, &config);
        assert_eq!(estimates.predictions.dim(), (3, 2));
        assert!(estimates.variances.iter().all(|v| v.is_infinite()));
        let cov = estimates.covariances.as_ref().unwrap();
        assert_eq!(cov.dim(), (2, 3, 3));
        assert!(cov[[1, 2, 2]].is_infinite());
        assert_eq!(cov[[1, 0, 2]], 0.);
        assert_eq!(
            estimates.status_messages(),
            vec!["Zero sensor data, correction factors applied"; 2]
        );
        assert!(!estimates.is_complete());

        let config = EstimatorConfig::default().apply_corrections(false);
        let estimates = Estimates {
            status: vec![EstimateStatus::Success],
            ..Estimates::failed(1, Array1::zeros(1), EstimateStatus::Cancelled, &config)
        };
        assert!(estimates.covariances.is_none());
        assert_eq!(estimates.status_messages(), vec!["Success, no correction applied"]);
        assert!(estimates.is_complete());

        let config = EstimatorConfig::default().aggregation_hours(Some(3.));
        let estimates = Estimates {
            status: vec![EstimateStatus::Success],
            ..Estimates::failed(1, Array1::zeros(1), EstimateStatus::Cancelled, &config)
        };
        assert_eq!(
            estimates.status_messages(),
            vec!["Success, aggregation of 3 hours, correction factors applied"]
        );
    }

    #[test]
    fn test_bad_variance() {
        assert!(!has_bad_variance(&array![[0.5, -1e-9]]));
        assert!(has_bad_variance(&array![[0.5, -1e-3]]));
        assert!(has_bad_variance(&array![[f64::NAN]]));
    }

    #[test]
    fn test_escalation_gives_up_on_bad_variances() {
        let mut jitters = vec![];
        let result = predict_with_escalation(0.1, |jitter| {
            jitters.push(jitter);
            Ok(posterior(array![[0.5, -0.2]], jitter))
        })
        .unwrap();
        assert!(result.is_none());
        assert_eq!(jitters.len(), 2);
        assert!((jitters[1] - 0.1 * JITTER_ESCALATION).abs() < 1e-12);

        let mut jitters = vec![];
        let result = predict_with_escalation(0., |jitter| {
            jitters.push(jitter);
            Ok(posterior(array![[f64::NAN]], jitter))
        })
        .unwrap();
        assert!(result.is_none());
        assert_eq!(jitters, vec![0., 1e-6]);
    }

    #[test]
    fn test_escalation_recovers() {
        let mut calls = 0;
        let result = predict_with_escalation(0.1, |jitter| {
            calls += 1;
            let var = if jitter > 0.1 { array![[0.3]] } else { array![[-0.3]] };
            Ok(posterior(var, jitter))
        })
        .unwrap()
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(result.var, array![[0.3]]);

        let mut calls = 0;
        let result = predict_with_escalation(0.1, |jitter| {
            calls += 1;
            Ok(posterior(array![[0.3]], jitter))
        })
        .unwrap();
        assert!(result.is_some());
        assert_eq!(calls, 1);
    }
}
