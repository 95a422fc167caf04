//! Conversion of scattered sensor observations into a dense sensors x time bins matrix.
//!
//! Steps, in order:
//! 1. readings are assigned to fixed width time bins counted from 2000-01-01 UTC,
//! 2. same sensor same bin readings are reduced to their median (or mean for time aggregates),
//! 3. short runs of missing bins are linearly interpolated (or extended at the edges),
//! 4. sensors still missing too many bins are dropped,
//! 5. remaining holes are filled with the mean of the other sensors in the same bin.

use crate::errors::{EstimateError, Result};
use crate::types::TimeRange;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayViewMut1, Axis};
use pmkrig_gp::{SpaceTimeData, TimeAxis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 2000-01-01T00:00:00Z in milliseconds since the Unix epoch
const BIN_EPOCH_MS: i64 = 946_684_800_000;

/// A corrected reading located in planar coordinates
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// Sensor identifier
    pub sensor_id: String,
    /// (easting, northing, elevation) in meters
    pub position: [f64; 3],
    /// Measurement time
    pub timestamp: DateTime<Utc>,
    /// Corrected concentration
    pub value: f64,
}

/// Reduction of the readings of one sensor in one bin
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinStatistic {
    /// Median, damps single reading spikes
    #[default]
    Median,
    /// Mean, used for time aggregates
    Mean,
}

impl BinStatistic {
    fn reduce(&self, values: &mut [f64]) -> f64 {
        match self {
            BinStatistic::Median => median(values),
            BinStatistic::Mean => values.iter().sum::<f64>() / values.len() as f64,
        }
    }
}

/// Binning and cleaning thresholds
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Time bin width in minutes
    pub bin_minutes: f64,
    /// Reduction of readings sharing a bin
    pub statistic: BinStatistic,
    /// Runs of missing bins shorter than this are filled by interpolation
    pub max_gap_bins: usize,
    /// Minimum fraction of bins a sensor must have after interpolation to be kept
    pub min_presence_ratio: f64,
    /// A warning is raised when more than this fraction of sensors is dropped
    pub prune_warn_fraction: f64,
    /// A warning is raised for bins where fewer than this fraction of sensors report
    pub min_bin_coverage: f64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        MatrixConfig {
            bin_minutes: 8.,
            statistic: BinStatistic::Median,
            max_gap_bins: 6,
            min_presence_ratio: 0.6,
            prune_warn_fraction: 0.3,
            min_bin_coverage: 0.65,
        }
    }
}

impl MatrixConfig {
    /// Bin width in hours
    pub fn bin_hours(&self) -> f64 {
        self.bin_minutes / 60.
    }

    /// Check thresholds are consistent
    pub fn validate(&self) -> Result<()> {
        if !(self.bin_minutes.is_finite() && self.bin_minutes * 60_000. >= 1.) {
            return Err(EstimateError::InvalidConfig(format!(
                "bin width should be positive, got {} min",
                self.bin_minutes
            )));
        }
        for (name, v) in [
            ("min presence ratio", self.min_presence_ratio),
            ("prune warning fraction", self.prune_warn_fraction),
            ("min bin coverage", self.min_bin_coverage),
        ] {
            if !(0. ..=1.).contains(&v) {
                return Err(EstimateError::InvalidConfig(format!(
                    "{name} should be in [0, 1], got {v}"
                )));
            }
        }
        Ok(())
    }

    fn bin_millis(&self) -> i64 {
        (self.bin_minutes * 60_000.).round() as i64
    }

    /// Index of the bin containing `t`, counted from 2000-01-01 UTC
    pub fn bin_index(&self, t: &DateTime<Utc>) -> i64 {
        (t.timestamp_millis() - BIN_EPOCH_MS).div_euclid(self.bin_millis())
    }
}

/// What happened while building a matrix
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatrixReport {
    /// Observations falling in the time range
    pub n_observations: usize,
    /// Distinct sensors seen
    pub n_sensors: usize,
    /// Sensors dropped for missing too many bins
    pub n_pruned: usize,
    /// Cells filled by gap interpolation or edge extension
    pub n_interpolated: usize,
    /// Cells filled with the bin mean
    pub n_filled: usize,
    /// Bins below the minimum coverage
    pub n_sparse_bins: usize,
}

/// Dense sensors x time bins matrix ready for model fitting
#[derive(Clone, Debug)]
pub struct SensorMatrix {
    data: Array2<f64>,
    space: Array2<f64>,
    sensor_ids: Vec<String>,
    first_bin: i64,
    bin_hours: f64,
    bin_config: MatrixConfig,
    report: MatrixReport,
}

impl SensorMatrix {
    /// Concentrations (n_sensors, n_bins)
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Sensor positions (n_sensors, 3)
    pub fn space(&self) -> &Array2<f64> {
        &self.space
    }

    /// Kept sensors, in row order
    pub fn sensor_ids(&self) -> &[String] {
        &self.sensor_ids
    }

    /// Row of a sensor
    pub fn row_of(&self, sensor_id: &str) -> Option<usize> {
        self.sensor_ids.iter().position(|id| id == sensor_id)
    }

    /// Number of time bins
    pub fn n_bins(&self) -> usize {
        self.data.ncols()
    }

    /// Build report
    pub fn report(&self) -> &MatrixReport {
        &self.report
    }

    /// Time of `t` in hours from the first bin, floored to its bin
    pub fn time_offset_hours(&self, t: &DateTime<Utc>) -> f64 {
        (self.bin_config.bin_index(t) - self.first_bin) as f64 * self.bin_hours
    }

    /// Training dataset on a regular time axis
    pub fn dataset(&self) -> Result<SpaceTimeData<f64>> {
        Ok(SpaceTimeData::new(
            self.space.clone(),
            TimeAxis::regular(self.bin_hours, self.n_bins()),
            self.data.clone(),
        )?)
    }
}

/// Median of non empty values
fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Fill runs shorter than `max_gap` missing values: linearly between two valid values,
/// with the nearest valid value at the row edges. Returns the number of filled cells.
fn interpolate_gaps(mut row: ArrayViewMut1<Option<f64>>, max_gap: usize) -> usize {
    let n = row.len();
    let mut filled = 0;
    let mut t = 0;
    while t < n {
        if row[t].is_some() {
            t += 1;
            continue;
        }
        let start = t;
        while t < n && row[t].is_none() {
            t += 1;
        }
        let len = t - start;
        if len >= max_gap {
            continue;
        }
        let left = if start > 0 { row[start - 1] } else { None };
        let right = if t < n { row[t] } else { None };
        match (left, right) {
            (Some(a), Some(b)) => {
                for k in 0..len {
                    let w = (k + 1) as f64 / (len + 1) as f64;
                    row[start + k] = Some(a + w * (b - a));
                }
            }
            (Some(v), None) | (None, Some(v)) => {
                for k in start..t {
                    row[k] = Some(v);
                }
            }
            (None, None) => continue,
        }
        filled += len;
    }
    filled
}

/// Rows to keep: those whose missing fraction does not exceed `1 - min_presence_ratio`
fn presence_mask(cells: &Array2<Option<f64>>, min_presence_ratio: f64) -> Vec<bool> {
    let n_bins = cells.ncols() as f64;
    cells
        .rows()
        .into_iter()
        .map(|row| {
            let missing = row.iter().filter(|c| c.is_none()).count() as f64;
            missing / n_bins <= 1. - min_presence_ratio
        })
        .collect()
}

/// Replace missing cells by the mean of their column (0 for empty columns).
/// Returns the dense matrix and the number of bins below `min_coverage`.
fn fill_residual(cells: &Array2<Option<f64>>, min_coverage: f64) -> (Array2<f64>, usize) {
    let n_rows = cells.nrows() as f64;
    let column_means: Vec<(f64, f64)> = cells
        .axis_iter(Axis(1))
        .map(|col| {
            let (sum, count) = col
                .iter()
                .flatten()
                .fold((0., 0usize), |(s, c), v| (s + v, c + 1));
            let mean = if count > 0 { sum / count as f64 } else { 0. };
            (mean, count as f64 / n_rows)
        })
        .collect();
    let n_sparse = column_means
        .iter()
        .filter(|(_, coverage)| *coverage < min_coverage)
        .count();
    let data = Array2::from_shape_fn(cells.dim(), |(s, t)| {
        cells[[s, t]].unwrap_or(column_means[t].0)
    });
    (data, n_sparse)
}

/// Build the sensor matrix of `observations` over the bins covering `range`.
///
/// Observations outside `range` are ignored. Fails with
/// [`EstimateError::InsufficientData`] when no sensor remains.
pub fn build_matrix(
    observations: &[Observation],
    range: &TimeRange,
    config: &MatrixConfig,
) -> Result<SensorMatrix> {
    config.validate()?;
    if range.end < range.start {
        return Err(EstimateError::InvalidQuery(
            "matrix time range end is before its start".to_string(),
        ));
    }
    let first_bin = config.bin_index(&range.start);
    let n_bins = (config.bin_index(&range.end) - first_bin + 1) as usize;

    let mut sensors: BTreeMap<&str, [f64; 3]> = BTreeMap::new();
    let mut samples: BTreeMap<(&str, usize), Vec<f64>> = BTreeMap::new();
    let mut n_observations = 0;
    for obs in observations.iter().filter(|o| range.contains(&o.timestamp)) {
        let bin = (config.bin_index(&obs.timestamp) - first_bin) as usize;
        sensors.entry(obs.sensor_id.as_str()).or_insert(obs.position);
        samples
            .entry((obs.sensor_id.as_str(), bin))
            .or_default()
            .push(obs.value);
        n_observations += 1;
    }
    if sensors.is_empty() {
        return Err(EstimateError::InsufficientData(
            "no sensor reading in the time range".to_string(),
        ));
    }
    // rows follow sensor id order
    let rows: BTreeMap<&str, usize> = sensors.keys().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut cells = Array2::<Option<f64>>::from_elem((sensors.len(), n_bins), None);
    for ((id, bin), mut values) in samples {
        cells[[rows[id], bin]] = Some(config.statistic.reduce(&mut values));
    }

    let n_interpolated: usize = cells
        .rows_mut()
        .into_iter()
        .map(|row| interpolate_gaps(row, config.max_gap_bins))
        .sum();

    let keep = presence_mask(&cells, config.min_presence_ratio);
    let kept: Vec<usize> = (0..keep.len()).filter(|i| keep[*i]).collect();
    let n_pruned = sensors.len() - kept.len();
    let pruned_fraction = n_pruned as f64 / sensors.len() as f64;
    if pruned_fraction > config.prune_warn_fraction {
        warn!(
            "Dropped {n_pruned} of {} sensors missing more than {:.0}% of {n_bins} bins",
            sensors.len(),
            100. * (1. - config.min_presence_ratio)
        );
    }
    if kept.is_empty() {
        return Err(EstimateError::InsufficientData(format!(
            "all {} sensors miss too many time bins",
            sensors.len()
        )));
    }
    let cells = cells.select(Axis(0), &kept);
    let n_filled = cells.iter().filter(|c| c.is_none()).count();
    let (data, n_sparse_bins) = fill_residual(&cells, config.min_bin_coverage);
    if n_sparse_bins > 0 {
        warn!(
            "{n_sparse_bins} of {n_bins} time bins have less than {:.0}% of sensors reporting",
            100. * config.min_bin_coverage
        );
    }

    let ids: Vec<&str> = sensors.keys().copied().collect();
    let sensor_ids: Vec<String> = kept.iter().map(|i| ids[*i].to_string()).collect();
    let mut space = Array2::zeros((kept.len(), 3));
    for (mut row, id) in space.rows_mut().into_iter().zip(&sensor_ids) {
        row.assign(&Array1::from(sensors[id.as_str()].to_vec()));
    }

    let report = MatrixReport {
        n_observations,
        n_sensors: sensors.len(),
        n_pruned,
        n_interpolated,
        n_filled,
        n_sparse_bins,
    };
    debug!("Sensor matrix {:?}: {report:?}", data.dim());
    Ok(SensorMatrix {
        data,
        space,
        sensor_ids,
        first_bin,
        bin_hours: config.bin_hours(),
        bin_config: *config,
        report,
    })
}
