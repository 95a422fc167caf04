//! Area models: geographic extent, timezone, correction factors, length scales
//! and elevation raster of a monitored region.
//!
//! Areas are described in JSON, one object per area keyed by its id:
//!
//! ```json
//! {
//!   "slc_ut": {
//!     "Name": "Salt Lake City",
//!     "Timezone": "America/Denver",
//!     "Note": "SLC model",
//!     "Boundingbox": [{"Latitude": 40.0, "Longitude": -112.5}, ...],
//!     "Elevation File": "slc_elevations.npy",
//!     "Elevation Extent": {"Longitudes": [-112.5, -111.5], "Latitudes": [40.0, 41.0]},
//!     "Correction Factors": {
//!       "PMS5003": [{"starttime": "default", "endtime": "default",
//!                    "slope": 0.52, "intercept": 5.7, "note": "PMS5003 default"}]
//!     },
//!     "Length Scales": [{"starttime": "default", "endtime": "default",
//!                        "Space": 4300, "Time": 0.25, "Elevation": 30}]
//!   }
//! }
//! ```
//!
//! Times without offset are taken in the area timezone.

use crate::corrections::{CorrectionTable, LinearCorrection};
use crate::elevation::{ConstantElevation, ElevationGrid, ElevationLookup};
use crate::errors::{EstimateError, Result};
use crate::schedule::{LengthScaleSchedule, LengthScales, Schedule};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Marker of the fallback entry in correction and length scale lists
const DEFAULT_MARKER: &str = "default";

#[derive(Deserialize)]
struct RawVertex {
    #[serde(rename = "Latitude")]
    latitude: f64,
    #[serde(rename = "Longitude")]
    longitude: f64,
}

#[derive(Deserialize)]
struct RawExtent {
    #[serde(rename = "Longitudes")]
    longitudes: (f64, f64),
    #[serde(rename = "Latitudes")]
    latitudes: (f64, f64),
}

#[derive(Deserialize)]
struct RawCorrection {
    starttime: String,
    endtime: String,
    slope: f64,
    intercept: f64,
    #[serde(default)]
    note: String,
}

#[derive(Deserialize)]
struct RawLengthScales {
    starttime: String,
    endtime: String,
    #[serde(rename = "Space")]
    space: f64,
    #[serde(rename = "Time")]
    time: f64,
    #[serde(rename = "Elevation")]
    elevation: f64,
}

#[derive(Deserialize)]
struct RawArea {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Timezone")]
    timezone: String,
    #[serde(rename = "Note", default)]
    note: String,
    #[serde(rename = "Boundingbox")]
    boundary: Vec<RawVertex>,
    #[serde(rename = "Elevation File", default)]
    elevation_file: Option<String>,
    #[serde(rename = "Elevation Extent", default)]
    elevation_extent: Option<RawExtent>,
    #[serde(rename = "Correction Factors", default)]
    correction_factors: BTreeMap<String, Vec<RawCorrection>>,
    #[serde(rename = "Length Scales", default)]
    length_scales: Vec<RawLengthScales>,
}

/// Configuration of one monitored area, immutable once loaded
pub struct AreaConfig {
    id: String,
    name: String,
    note: String,
    timezone: Tz,
    boundary: Vec<(f64, f64)>,
    length_scales: LengthScaleSchedule,
    corrections: CorrectionTable,
    elevation: Box<dyn ElevationLookup>,
}

impl fmt::Debug for AreaConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AreaConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("timezone", &self.timezone)
            .field("boundary", &self.boundary.len())
            .finish()
    }
}

impl AreaConfig {
    /// Area without boundary, length scales nor corrections, at elevation 0
    pub fn new(id: impl Into<String>, name: impl Into<String>, timezone: Tz) -> Self {
        AreaConfig {
            id: id.into(),
            name: name.into(),
            note: String::new(),
            timezone,
            boundary: vec![],
            length_scales: LengthScaleSchedule::new(),
            corrections: CorrectionTable::new(),
            elevation: Box::new(ConstantElevation(0.)),
        }
    }

    /// Set the free text note
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Set the boundary polygon as (latitude, longitude) vertices
    pub fn boundary(mut self, vertices: Vec<(f64, f64)>) -> Self {
        self.boundary = vertices;
        self
    }

    /// Set the length scale schedule
    pub fn length_scales(mut self, schedule: LengthScaleSchedule) -> Self {
        self.length_scales = schedule;
        self
    }

    /// Set the correction factors
    pub fn corrections(mut self, table: CorrectionTable) -> Self {
        self.corrections = table;
        self
    }

    /// Set the elevation lookup
    pub fn elevation(mut self, lookup: impl ElevationLookup + 'static) -> Self {
        self.elevation = Box::new(lookup);
        self
    }

    /// Parse a single area description, relative raster paths are resolved from `base_dir`
    fn from_raw(id: &str, raw: RawArea, base_dir: &Path) -> Result<Self> {
        let timezone: Tz = raw.timezone.parse().map_err(|e| {
            EstimateError::InvalidConfig(format!("area {id}: unknown timezone {}: {e}", raw.timezone))
        })?;

        let mut corrections = CorrectionTable::new();
        for (key, rows) in raw.correction_factors {
            let schedule = rows.into_iter().try_fold(Schedule::new(), |schedule, row| {
                let correction = LinearCorrection {
                    slope: row.slope,
                    intercept: row.intercept,
                    note: row.note,
                };
                add_entry(schedule, &row.starttime, &row.endtime, correction, timezone)
            })?;
            corrections = corrections.insert(key, schedule);
        }

        let length_scales = raw
            .length_scales
            .into_iter()
            .try_fold(LengthScaleSchedule::new(), |schedule, row| {
                let scales = LengthScales {
                    space: row.space,
                    time: row.time,
                    elevation: row.elevation,
                };
                if !(scales.space > 0. && scales.time > 0. && scales.elevation > 0.) {
                    return Err(EstimateError::InvalidConfig(format!(
                        "area {id}: length scales should be positive, got {scales:?}"
                    )));
                }
                add_entry(schedule, &row.starttime, &row.endtime, scales, timezone)
            })?;
        if length_scales.is_empty() {
            warn!("Area {id} has no length scales, every estimate will fail");
        }

        let elevation: Box<dyn ElevationLookup> = match (raw.elevation_file, raw.elevation_extent) {
            (Some(file), Some(extent)) => Box::new(ElevationGrid::from_npy(
                base_dir.join(file),
                extent.longitudes,
                extent.latitudes,
            )?),
            (Some(file), None) => {
                return Err(EstimateError::InvalidConfig(format!(
                    "area {id}: elevation file {file} given without its extent"
                )))
            }
            _ => Box::new(ConstantElevation(0.)),
        };

        Ok(AreaConfig {
            id: id.to_string(),
            name: raw.name,
            note: raw.note,
            timezone,
            boundary: raw
                .boundary
                .into_iter()
                .map(|v| (v.latitude, v.longitude))
                .collect(),
            length_scales,
            corrections,
            elevation,
        })
    }

    /// Area id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Area name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free text note
    pub fn note_text(&self) -> &str {
        &self.note
    }

    /// Area timezone
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Correction factors table
    pub fn correction_table(&self) -> &CorrectionTable {
        &self.corrections
    }

    /// Length scales applying at `t`
    pub fn length_scales_for(&self, t: &DateTime<Utc>) -> Option<LengthScales> {
        self.length_scales.length_scales_for(t)
    }

    /// Elevation (meters) at a location
    pub fn elevation_at(&self, longitude: f64, latitude: f64) -> f64 {
        self.elevation.elevation(longitude, latitude)
    }

    /// Whether the location lies inside the boundary polygon (ray casting)
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        let n = self.boundary.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (lat_i, lon_i) = self.boundary[i];
            let (lat_j, lon_j) = self.boundary[j];
            if (lat_i > latitude) != (lat_j > latitude)
                && longitude < (lon_j - lon_i) * (latitude - lat_i) / (lat_j - lat_i) + lon_i
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Parse a time, naive times are taken in the area timezone
    pub fn parse_time(&self, value: &str) -> Result<DateTime<Utc>> {
        parse_time(value, self.timezone)
    }
}

fn add_entry<T>(
    schedule: Schedule<T>,
    start: &str,
    end: &str,
    value: T,
    timezone: Tz,
) -> Result<Schedule<T>> {
    if start == DEFAULT_MARKER {
        Ok(schedule.default_value(value))
    } else {
        let (start, end) = (parse_time(start, timezone)?, parse_time(end, timezone)?);
        if end <= start {
            return Err(EstimateError::InvalidConfig(format!(
                "time window end {end} should be after start {start}"
            )));
        }
        Ok(schedule.window(start, end, value))
    }
}

/// Parse an RFC 3339 time, or a naive date/time taken in `timezone`
pub fn parse_time(value: &str, timezone: Tz) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| EstimateError::InvalidConfig(format!("unparsable time {value}")))?;
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            EstimateError::InvalidConfig(format!("time {value} does not exist in {timezone}"))
        })
}

/// Set of areas, looked up by id or by location
#[derive(Debug, Default)]
pub struct AreaRegistry {
    areas: Vec<AreaConfig>,
}

impl AreaRegistry {
    /// Registry of the given areas
    pub fn new(areas: Vec<AreaConfig>) -> Self {
        AreaRegistry { areas }
    }

    /// Parse areas from a JSON document, relative raster paths are resolved from `base_dir`
    pub fn from_json_str(content: &str, base_dir: &Path) -> Result<Self> {
        let raw: BTreeMap<String, RawArea> = serde_json::from_str(content)?;
        let areas = raw
            .into_iter()
            .map(|(id, area)| AreaConfig::from_raw(&id, area, base_dir))
            .collect::<Result<Vec<_>>>()?;
        info!("Loaded {} area models", areas.len());
        Ok(AreaRegistry { areas })
    }

    /// Load areas from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let base_dir = path.as_ref().parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&content, base_dir)
    }

    /// Number of areas
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Area with the given id
    pub fn by_id(&self, id: &str) -> Option<&AreaConfig> {
        self.areas.iter().find(|a| a.id == id)
    }

    /// First area containing the location
    pub fn by_location(&self, latitude: f64, longitude: f64) -> Option<&AreaConfig> {
        let area = self.areas.iter().find(|a| a.contains(latitude, longitude));
        if area.is_none() {
            warn!("Query location {latitude},{longitude} not in any known model area");
        }
        area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const AREAS: &str = r#"{
        "slc_ut": {
            "Name": "Salt Lake City",
            "Timezone": "America/Denver",
            "Note": "test model",
            "Boundingbox": [
                {"Latitude": 40.0, "Longitude": -112.5},
                {"Latitude": 41.0, "Longitude": -112.5},
                {"Latitude": 41.0, "Longitude": -111.5},
                {"Latitude": 40.0, "Longitude": -111.5}
            ],
            "Correction Factors": {
                "PMS5003": [
                    {"starttime": "default", "endtime": "default", "slope": 0.5, "intercept": 1.0, "note": "default PMS"},
                    {"starttime": "2022-01-01 00:00:00", "endtime": "2022-07-01 00:00:00", "slope": 0.8, "intercept": 0.0, "note": "winter"}
                ]
            },
            "Length Scales": [
                {"starttime": "2022-01-01", "endtime": "2022-02-01", "Space": 2000, "Time": 0.5, "Elevation": 50},
                {"starttime": "default", "endtime": "default", "Space": 4300, "Time": 0.25, "Elevation": 30}
            ]
        }
    }"#;

    #[test]
    fn test_load_registry() {
        let registry = AreaRegistry::from_json_str(AREAS, Path::new(".")).unwrap();
        assert_eq!(registry.len(), 1);
        let area = registry.by_id("slc_ut").unwrap();
        assert_eq!(area.name(), "Salt Lake City");
        assert_eq!(area.timezone(), chrono_tz::America::Denver);
        assert!(registry.by_location(40.76, -111.89).is_some());
        assert!(registry.by_location(39., -111.89).is_none());
        assert_abs_diff_eq!(area.elevation_at(-111.89, 40.76), 0.);
    }

    #[test]
    fn test_naive_times_in_area_timezone() {
        let registry = AreaRegistry::from_json_str(AREAS, Path::new(".")).unwrap();
        let area = registry.by_id("slc_ut").unwrap();
        // midnight in Denver is 07:00 UTC in winter
        let before = area.parse_time("2022-01-01T06:59:00Z").unwrap();
        let after = area.parse_time("2022-01-01T07:00:00Z").unwrap();
        assert_eq!(area.length_scales_for(&before).unwrap().time, 0.25);
        assert_eq!(area.length_scales_for(&after).unwrap().time, 0.5);

        let c = area
            .correction_table()
            .correct(Some("PMS5003"), None, &after, 10.);
        assert_abs_diff_eq!(c.value, 8.);
        let c = area
            .correction_table()
            .correct(Some("PMS5003"), None, &before, 10.);
        assert_abs_diff_eq!(c.value, 6.);
    }

    #[test]
    fn test_invalid_area() {
        let bad_tz = AREAS.replace("America/Denver", "Mars/Olympus");
        assert!(AreaRegistry::from_json_str(&bad_tz, Path::new(".")).is_err());
        let bad_scale = AREAS.replace("\"Space\": 2000", "\"Space\": -2000");
        assert!(AreaRegistry::from_json_str(&bad_scale, Path::new(".")).is_err());
        let no_extent = AREAS.replace(
            "\"Note\": \"test model\",",
            "\"Note\": \"test model\", \"Elevation File\": \"elev.npy\",",
        );
        assert!(AreaRegistry::from_json_str(&no_extent, Path::new(".")).is_err());
    }

    #[test]
    fn test_polygon_contains() {
        let area = AreaConfig::new("tri", "triangle", chrono_tz::UTC).boundary(vec![
            (0., 0.),
            (0., 10.),
            (10., 0.),
        ]);
        assert!(area.contains(2., 2.));
        assert!(!area.contains(6., 6.));
        assert!(!AreaConfig::new("empty", "empty", chrono_tz::UTC).contains(0., 0.));
    }
}
